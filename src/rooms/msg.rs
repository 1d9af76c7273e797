use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::{
    auth::{AuthError, Principal},
    db::{self, Message, MessageKind, NewMessage},
    fabric::{BroadcastFabric, Envelope, FabricError},
};

/// What a client sends over the socket.
#[derive(Debug, Default, Deserialize)]
pub struct InboundMessage {
    /// Absent and `null` both read as no text.
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Reference to an already-stored attachment.
    #[serde(default)]
    pub file: Option<String>,
}

/// What every connection in the room receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundMessage {
    pub message_type: MessageKind,
    pub message_content: String,
    pub sender_id: Uuid,
    pub parent_id: Option<Uuid>,
}

impl From<&Envelope> for OutboundMessage {
    fn from(envelope: &Envelope) -> Self {
        OutboundMessage {
            message_type: envelope.kind,
            message_content: envelope.body.clone(),
            sender_id: envelope.sender_id,
            parent_id: envelope.parent_id,
        }
    }
}

#[derive(Debug)]
pub enum Submitted {
    Published(Message),
    /// The reply target didn't resolve; nothing was stored or broadcast.
    Dropped,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("sender is no longer authenticated: {0}")]
    Unauthenticated(AuthError),
    #[error("message store: {0}")]
    Store(#[from] sqlx::Error),
    #[error("message {message_id} stored but not broadcast: {source}")]
    Publish {
        message_id: Uuid,
        #[source]
        source: FabricError,
    },
}

/// Stores `inbound` in `room_id` as sent by `sender`, then publishes it on the
/// room's topic. Nothing is published unless the store succeeded.
///
/// Ordering holds per sender only: a session awaits each submit before reading
/// its next frame, so one sender's messages are stored and delivered in the
/// order sent. Submits from different senders in the same room run
/// concurrently, and the order they are stored in may differ from the order
/// they are delivered in.
pub async fn submit(
    db_pool: &SqlitePool,
    fabric: &dyn BroadcastFabric,
    sender: &Principal,
    room_id: Uuid,
    inbound: InboundMessage,
) -> Result<Submitted, SubmitError> {
    match sender.reverify(db_pool).await {
        Ok(()) => {}
        Err(AuthError::Db(e)) => return Err(SubmitError::Store(e)),
        Err(e) => return Err(SubmitError::Unauthenticated(e)),
    }

    let parent_id = inbound.parent_id.as_deref().map(str::trim).filter(|raw| !raw.is_empty());
    let parent_id = match parent_id {
        None => None,
        Some(raw) => {
            let Ok(parent_id) = Uuid::parse_str(raw) else {
                debug!(%room_id, parent_id = raw, "dropping reply to malformed parent id");
                return Ok(Submitted::Dropped);
            };
            if db::find_message_in_room(db_pool, room_id, parent_id).await?.is_none() {
                debug!(%room_id, %parent_id, "dropping reply to unknown parent");
                return Ok(Submitted::Dropped);
            }
            Some(parent_id)
        }
    };

    let kind = MessageKind::parse_lenient(inbound.kind.as_deref());
    let content = inbound.content.unwrap_or_default();
    let file_only = content.is_empty() && inbound.file.is_some();
    let message = db::insert_message(db_pool, NewMessage {
        room_id,
        user_id: sender.user_id,
        content: (!file_only).then_some(content.as_str()),
        kind,
        file: inbound.file.as_deref(),
        parent_id,
    })
    .await?;

    let envelope = Envelope {
        kind,
        body: content,
        sender_id: sender.user_id,
        parent_id,
    };
    fabric
        .publish(room_id, envelope)
        .await
        .map_err(|source| SubmitError::Publish { message_id: message.id, source })?;

    debug!(%room_id, message_id = %message.id, "message published");
    Ok(Submitted::Published(message))
}
