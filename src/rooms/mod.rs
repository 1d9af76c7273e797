//! Room-scoped chat: the socket gateway and the read path.

pub mod list;
pub mod msg;
pub mod resolve;
pub mod session;
pub mod ws;

use axum::{routing::get, Router};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::room_ws))
        .route("/rooms", get(list::rooms))
        .route("/rooms/{room_id}/messages", get(list::messages))
}
