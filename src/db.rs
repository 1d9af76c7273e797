use std::{str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    FromRow, SqlitePool,
};
use uuid::Uuid;

pub async fn connect(url: &str, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
}

pub async fn migrate(db_pool: &SqlitePool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(db_pool).await
}

/// Milliseconds since the Unix epoch, the unit every `created_at` column uses.
pub fn now_millis() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn millis_to_datetime(millis: i64) -> time::OffsetDateTime {
    time::OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000)
        .unwrap_or(time::OffsetDateTime::UNIX_EPOCH)
}

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub is_active: bool,
    pub is_staff: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct UserSummary {
    pub id: Uuid,
    pub username: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct Room {
    pub id: Uuid,
    pub name: Option<String>,
    pub direct_key: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum MessageKind {
    #[default]
    Text,
    File,
    Image,
}

impl MessageKind {
    /// Anything that isn't a known kind falls back to `Text`.
    pub fn parse_lenient(raw: Option<&str>) -> MessageKind {
        match raw.map(str::to_ascii_uppercase).as_deref() {
            Some("FILE") => MessageKind::File,
            Some("IMAGE") => MessageKind::Image,
            _ => MessageKind::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum MessageStatus {
    #[default]
    Sent,
    Delivered,
    Read,
}

#[derive(Debug, Clone, FromRow)]
pub struct Message {
    pub id: Uuid,
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub content: Option<String>,
    pub message_type: MessageKind,
    pub status: MessageStatus,
    pub file: Option<String>,
    pub parent_id: Option<Uuid>,
    pub created_at: i64,
}

/// A message joined with its sender's username, as the read path lists them.
#[derive(Debug, Clone, FromRow)]
pub struct MessageWithSender {
    pub id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub content: Option<String>,
    pub message_type: MessageKind,
    pub status: MessageStatus,
    pub file: Option<String>,
    pub parent_id: Option<Uuid>,
    pub created_at: i64,
}

pub struct NewMessage<'a> {
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub content: Option<&'a str>,
    pub kind: MessageKind,
    pub file: Option<&'a str>,
    pub parent_id: Option<Uuid>,
}

// users

pub async fn insert_user(
    db_pool: &SqlitePool,
    username: &str,
    is_staff: bool,
) -> Result<User, sqlx::Error> {
    let id = Uuid::now_v7();
    sqlx::query("INSERT INTO users (id,username,is_active,is_staff,created_at) VALUES (?,?,1,?,?)")
        .bind(id)
        .bind(username)
        .bind(is_staff)
        .bind(now_millis())
        .execute(db_pool)
        .await?;

    Ok(User { id, username: username.to_owned(), is_active: true, is_staff })
}

pub async fn set_user_active(
    db_pool: &SqlitePool,
    user_id: Uuid,
    is_active: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET is_active=? WHERE id=?")
        .bind(is_active)
        .bind(user_id)
        .execute(db_pool)
        .await?;
    Ok(())
}

pub async fn find_active_user(
    db_pool: &SqlitePool,
    user_id: Uuid,
) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as("SELECT id,username,is_active,is_staff FROM users WHERE id=? AND is_active=1")
        .bind(user_id)
        .fetch_optional(db_pool)
        .await
}

// rooms and membership

pub async fn find_room(db_pool: &SqlitePool, room_id: Uuid) -> Result<Option<Room>, sqlx::Error> {
    sqlx::query_as("SELECT id,name,direct_key,created_at FROM rooms WHERE id=?")
        .bind(room_id)
        .fetch_optional(db_pool)
        .await
}

pub async fn find_direct_room(
    db_pool: &SqlitePool,
    direct_key: &str,
) -> Result<Option<Room>, sqlx::Error> {
    sqlx::query_as("SELECT id,name,direct_key,created_at FROM rooms WHERE direct_key=?")
        .bind(direct_key)
        .fetch_optional(db_pool)
        .await
}

/// Creates a room and attaches `members` in one transaction.
///
/// With a `direct_key` the insert is guarded by the unique index on that column, so a
/// caller racing another process for the same pair gets a unique-violation error back
/// and nothing is written.
pub async fn insert_room(
    db_pool: &SqlitePool,
    name: Option<&str>,
    direct_key: Option<&str>,
    members: &[Uuid],
) -> Result<Room, sqlx::Error> {
    let room = Room {
        id: Uuid::now_v7(),
        name: name.map(str::to_owned),
        direct_key: direct_key.map(str::to_owned),
        created_at: now_millis(),
    };

    let mut tx = db_pool.begin().await?;
    sqlx::query("INSERT INTO rooms (id,name,direct_key,created_at) VALUES (?,?,?,?)")
        .bind(room.id)
        .bind(&room.name)
        .bind(&room.direct_key)
        .bind(room.created_at)
        .execute(&mut *tx)
        .await?;

    for member in members {
        sqlx::query("INSERT OR IGNORE INTO room_members (room_id,user_id) VALUES (?,?)")
            .bind(room.id)
            .bind(member)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    Ok(room)
}

pub async fn is_member(
    db_pool: &SqlitePool,
    room_id: Uuid,
    user_id: Uuid,
) -> Result<bool, sqlx::Error> {
    Ok(sqlx::query("SELECT 1 FROM room_members WHERE room_id=? AND user_id=?")
        .bind(room_id)
        .bind(user_id)
        .fetch_optional(db_pool)
        .await?
        .is_some())
}

pub async fn room_members(
    db_pool: &SqlitePool,
    room_id: Uuid,
) -> Result<Vec<UserSummary>, sqlx::Error> {
    sqlx::query_as(
        "SELECT users.id,users.username FROM room_members
         JOIN users ON users.id=room_members.user_id
         WHERE room_members.room_id=? ORDER BY users.username",
    )
    .bind(room_id)
    .fetch_all(db_pool)
    .await
}

pub async fn rooms_for_user(
    db_pool: &SqlitePool,
    user_id: Uuid,
    limit: i64,
    offset: i64,
) -> Result<Vec<Room>, sqlx::Error> {
    sqlx::query_as(
        "SELECT rooms.id,rooms.name,rooms.direct_key,rooms.created_at FROM rooms
         JOIN room_members ON room_members.room_id=rooms.id
         WHERE room_members.user_id=?
         ORDER BY rooms.created_at DESC, rooms.id DESC
         LIMIT ? OFFSET ?",
    )
    .bind(user_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(db_pool)
    .await
}

pub async fn count_rooms_for_user(db_pool: &SqlitePool, user_id: Uuid) -> Result<i64, sqlx::Error> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM room_members WHERE user_id=?")
        .bind(user_id)
        .fetch_one(db_pool)
        .await?;
    Ok(count)
}

// messages

const MESSAGE_COLUMNS: &str =
    "id,room_id,user_id,content,message_type,status,file,parent_id,created_at";
const MESSAGE_WITH_SENDER_COLUMNS: &str = concat!(
    "messages.id,messages.user_id,users.username,messages.content,messages.message_type,",
    "messages.status,messages.file,messages.parent_id,messages.created_at",
);

pub async fn find_message_in_room(
    db_pool: &SqlitePool,
    room_id: Uuid,
    message_id: Uuid,
) -> Result<Option<Message>, sqlx::Error> {
    sqlx::query_as(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id=? AND room_id=?"))
        .bind(message_id)
        .bind(room_id)
        .fetch_optional(db_pool)
        .await
}

pub async fn insert_message(
    db_pool: &SqlitePool,
    new: NewMessage<'_>,
) -> Result<Message, sqlx::Error> {
    let message = Message {
        id: Uuid::now_v7(),
        room_id: new.room_id,
        user_id: new.user_id,
        content: new.content.map(str::to_owned),
        message_type: new.kind,
        status: MessageStatus::Sent,
        file: new.file.map(str::to_owned),
        parent_id: new.parent_id,
        created_at: now_millis(),
    };

    sqlx::query(&format!("INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES (?,?,?,?,?,?,?,?,?)"))
        .bind(message.id)
        .bind(message.room_id)
        .bind(message.user_id)
        .bind(&message.content)
        .bind(message.message_type)
        .bind(message.status)
        .bind(&message.file)
        .bind(message.parent_id)
        .bind(message.created_at)
        .execute(db_pool)
        .await?;

    Ok(message)
}

pub async fn latest_message(
    db_pool: &SqlitePool,
    room_id: Uuid,
) -> Result<Option<MessageWithSender>, sqlx::Error> {
    sqlx::query_as(&format!(
        "SELECT {MESSAGE_WITH_SENDER_COLUMNS} FROM messages
         JOIN users ON users.id=messages.user_id
         WHERE messages.room_id=?
         ORDER BY messages.created_at DESC, messages.id DESC LIMIT 1"
    ))
    .bind(room_id)
    .fetch_optional(db_pool)
    .await
}

/// One page of a room's history, newest first, strictly older than `before`.
pub async fn messages_before(
    db_pool: &SqlitePool,
    room_id: Uuid,
    before: Option<(i64, Uuid)>,
    limit: i64,
) -> Result<Vec<MessageWithSender>, sqlx::Error> {
    let (created_at, id) = before.unwrap_or((i64::MAX, Uuid::max()));
    sqlx::query_as(&format!(
        "SELECT {MESSAGE_WITH_SENDER_COLUMNS} FROM messages
         JOIN users ON users.id=messages.user_id
         WHERE messages.room_id=?
           AND (messages.created_at<? OR (messages.created_at=? AND messages.id<?))
         ORDER BY messages.created_at DESC, messages.id DESC LIMIT ?"
    ))
    .bind(room_id)
    .bind(created_at)
    .bind(created_at)
    .bind(id)
    .bind(limit)
    .fetch_all(db_pool)
    .await
}

pub async fn count_messages(db_pool: &SqlitePool, room_id: Uuid) -> Result<i64, sqlx::Error> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE room_id=?")
        .bind(room_id)
        .fetch_one(db_pool)
        .await?;
    Ok(count)
}

// revoked tokens

pub async fn revoke_token(db_pool: &SqlitePool, jti: &str) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT OR IGNORE INTO revoked_tokens (jti,revoked_at) VALUES (?,?)")
        .bind(jti)
        .bind(now_millis())
        .execute(db_pool)
        .await?;
    Ok(())
}

pub async fn is_token_revoked(db_pool: &SqlitePool, jti: &str) -> Result<bool, sqlx::Error> {
    Ok(sqlx::query("SELECT 1 FROM revoked_tokens WHERE jti=?")
        .bind(jti)
        .fetch_optional(db_pool)
        .await?
        .is_some())
}
