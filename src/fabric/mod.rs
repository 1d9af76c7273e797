//! Room-keyed publish/subscribe.
//!
//! Every gateway process keeps a [`LocalHub`] of the sinks belonging to its own
//! connections. A [`BroadcastFabric`] decides how a publish reaches the hubs:
//! directly ([`InProcessFabric`]) or through Redis pub/sub so that every process
//! sees it ([`RedisFabric`]). The fabric never looks inside an envelope.

mod hub;
mod memory;
mod pubsub;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::db::MessageKind;

pub use hub::{LocalHub, SinkId};
pub use memory::InProcessFabric;
pub use pubsub::{Backoff, RedisFabric};

/// Topics are room ids.
pub type Topic = Uuid;

pub type Sink = mpsc::UnboundedSender<Arc<Envelope>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: MessageKind,
    pub body: String,
    pub sender_id: Uuid,
    pub parent_id: Option<Uuid>,
}

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("redis: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("envelope encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("pub/sub stream ended")]
    Disconnected,
}

#[async_trait]
pub trait BroadcastFabric: Send + Sync {
    fn subscribe(&self, topic: Topic, sink: Sink) -> SinkId;

    /// Removing a sink that is already gone is a no-op.
    fn unsubscribe(&self, topic: Topic, sink: SinkId);

    async fn publish(&self, topic: Topic, envelope: Envelope) -> Result<(), FabricError>;

    /// Sinks this process holds for `topic`.
    fn local_subscribers(&self, topic: Topic) -> usize;
}

/// A live registration of one sink under one topic. Dropping it unsubscribes.
pub struct Subscription {
    fabric: Arc<dyn BroadcastFabric>,
    topic: Topic,
    sink: Option<SinkId>,
    receiver: Option<mpsc::UnboundedReceiver<Arc<Envelope>>>,
}

impl Subscription {
    pub fn open(fabric: Arc<dyn BroadcastFabric>, topic: Topic) -> Subscription {
        let (sink, receiver) = mpsc::unbounded_channel();
        let sink = fabric.subscribe(topic, sink);
        Subscription { fabric, topic, sink: Some(sink), receiver: Some(receiver) }
    }

    /// Hands the delivery side to whoever forwards envelopes to the connection.
    /// Only the first call gets it.
    pub fn take_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<Arc<Envelope>>> {
        self.receiver.take()
    }

    pub fn is_open(&self) -> bool {
        self.sink.is_some()
    }

    pub fn close(&mut self) {
        if let Some(sink) = self.sink.take() {
            self.fabric.unsubscribe(self.topic, sink);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}
