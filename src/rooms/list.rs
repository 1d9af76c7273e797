use axum::{
    debug_handler,
    extract::{Path, Query, State},
    Json,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    db::{self, MessageKind, MessageStatus, MessageWithSender, UserSummary},
    AppError, AppResult,
};

const DEFAULT_ROOM_LIMIT: i64 = 20;
const MAX_ROOM_LIMIT: i64 = 100;
const MESSAGE_PAGE: usize = 25;

#[derive(Debug, Deserialize)]
pub struct RoomsQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    cursor: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RoomPage {
    count: i64,
    limit: i64,
    offset: i64,
    results: Vec<RoomView>,
}

#[derive(Debug, Serialize)]
pub struct RoomView {
    id: Uuid,
    name: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    created: OffsetDateTime,
    users: Vec<UserSummary>,
    latest_message: Option<MessageView>,
}

#[derive(Debug, Serialize)]
pub struct MessagePage {
    next: Option<String>,
    results: Vec<MessageView>,
}

#[derive(Debug, Serialize)]
pub struct MessageView {
    id: Uuid,
    user: UserSummary,
    content: Option<String>,
    message_type: MessageKind,
    status: MessageStatus,
    file: Option<String>,
    parent: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    created: OffsetDateTime,
}

impl From<MessageWithSender> for MessageView {
    fn from(message: MessageWithSender) -> Self {
        MessageView {
            id: message.id,
            user: UserSummary { id: message.user_id, username: message.username },
            content: message.content,
            message_type: message.message_type,
            status: message.status,
            file: message.file,
            parent: message.parent_id,
            created: db::millis_to_datetime(message.created_at),
        }
    }
}

/// Rooms the requester belongs to, newest first.
#[debug_handler(state = crate::AppState)]
pub async fn rooms(
    AuthUser(principal): AuthUser,
    Query(query): Query<RoomsQuery>,
    State(db_pool): State<SqlitePool>,
) -> AppResult<Json<RoomPage>> {
    let limit = query.limit.unwrap_or(DEFAULT_ROOM_LIMIT).clamp(1, MAX_ROOM_LIMIT);
    let offset = query.offset.unwrap_or(0).max(0);

    let count = db::count_rooms_for_user(&db_pool, principal.user_id).await?;
    let mut results = Vec::new();
    for room in db::rooms_for_user(&db_pool, principal.user_id, limit, offset).await? {
        results.push(RoomView {
            id: room.id,
            name: room.name,
            created: db::millis_to_datetime(room.created_at),
            users: db::room_members(&db_pool, room.id).await?,
            latest_message: db::latest_message(&db_pool, room.id).await?.map(MessageView::from),
        });
    }

    Ok(Json(RoomPage { count, limit, offset, results }))
}

/// A room's history, newest first, one page per cursor.
#[debug_handler(state = crate::AppState)]
pub async fn messages(
    AuthUser(principal): AuthUser,
    Path(room_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
    State(db_pool): State<SqlitePool>,
) -> AppResult<Json<MessagePage>> {
    if db::find_room(&db_pool, room_id).await?.is_none() {
        return Err(AppError::NotFound);
    }
    if !principal.is_staff && !db::is_member(&db_pool, room_id, principal.user_id).await? {
        return Err(AppError::Forbidden);
    }

    let before = match query.cursor.as_deref() {
        Some(cursor) => {
            let malformed = || AppError::BadRequest("malformed cursor".to_owned());
            Some(decode_cursor(cursor).ok_or_else(malformed)?)
        }
        None => None,
    };

    let mut rows = db::messages_before(&db_pool, room_id, before, MESSAGE_PAGE as i64 + 1).await?;
    let next = if rows.len() > MESSAGE_PAGE {
        rows.truncate(MESSAGE_PAGE);
        rows.last().map(|last| encode_cursor(last.created_at, last.id))
    } else {
        None
    };

    Ok(Json(MessagePage { next, results: rows.into_iter().map(MessageView::from).collect() }))
}

fn encode_cursor(created_at: i64, id: Uuid) -> String {
    URL_SAFE_NO_PAD.encode(format!("{created_at}:{id}"))
}

fn decode_cursor(cursor: &str) -> Option<(i64, Uuid)> {
    let raw = URL_SAFE_NO_PAD.decode(cursor).ok()?;
    let raw = String::from_utf8(raw).ok()?;
    let (created_at, id) = raw.split_once(':')?;
    Some((created_at.parse().ok()?, id.parse().ok()?))
}
