use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::info;

use crate::{
    auth::{self, Keys},
    db,
    rooms::{
        resolve::{self, ConnectQuery, ResolveError},
        session::{self, Session, UNAUTHENTICATED_CLOSE_CODE},
    },
    AppState,
};

pub const CLOSE_CODE_HEADER: HeaderName = HeaderName::from_static("x-close-code");

/// Why a handshake was refused. The client only ever sees a bare 403.
#[derive(Debug, Error)]
pub enum Rejection {
    #[error("no valid credential")]
    Anonymous,
    #[error("room unresolved: {0}")]
    Unresolved(#[from] ResolveError),
    #[error("not a member of the room")]
    NotMember,
    #[error("handshake timed out")]
    TimedOut,
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        match self {
            Rejection::Anonymous => (
                StatusCode::FORBIDDEN,
                [(CLOSE_CODE_HEADER, HeaderValue::from(UNAUTHENTICATED_CLOSE_CODE))],
            )
                .into_response(),
            _ => StatusCode::FORBIDDEN.into_response(),
        }
    }
}

/// Authenticates the handshake, resolves its room and checks membership.
/// Nothing is subscribed until the returned session is activated.
pub async fn admit(
    db_pool: &SqlitePool,
    keys: &Keys,
    headers: &HeaderMap,
    query: &ConnectQuery,
) -> Result<Session, Rejection> {
    let principal = auth::identify(db_pool, keys, headers).await.ok_or(Rejection::Anonymous)?;
    let selector = query.selector()?;
    let room_id = resolve::resolve(db_pool, principal.user_id, selector).await?;

    let member = db::is_member(db_pool, room_id, principal.user_id)
        .await
        .map_err(ResolveError::from)?;
    if !member {
        return Err(Rejection::NotMember);
    }
    Ok(Session::admitted(principal, room_id))
}

pub async fn room_ws(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<ConnectQuery>,
    State(state): State<AppState>,
) -> Response {
    let admitted = tokio::time::timeout(
        state.gateway.handshake_timeout,
        admit(&state.db_pool, &state.keys, &headers, &query),
    )
    .await
    .unwrap_or(Err(Rejection::TimedOut));

    match admitted {
        Ok(session) => ws.on_upgrade(move |socket| session::run(socket, session, state)),
        Err(rejection) => {
            info!(reason = %rejection, "handshake rejected");
            rejection.into_response()
        }
    }
}
