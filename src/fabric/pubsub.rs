use std::{sync::Arc, time::Duration};

use ::redis::{aio::ConnectionManager, AsyncCommands, Msg};
use async_trait::async_trait;
use futures_util::StreamExt;
use rand::Rng;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use super::{BroadcastFabric, Envelope, FabricError, LocalHub, Sink, SinkId, Topic};

/// Fanout across processes through Redis pub/sub.
///
/// Publishing goes to channel `{prefix}.{room_id}`. Each process runs one
/// listener that pattern-subscribes to `{prefix}.*` and feeds its own hub, so
/// subscribing a connection never touches Redis.
pub struct RedisFabric {
    hub: Arc<LocalHub>,
    client: ::redis::Client,
    publisher: ConnectionManager,
    prefix: String,
}

impl RedisFabric {
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<RedisFabric, FabricError> {
        let client = ::redis::Client::open(url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        Ok(RedisFabric {
            hub: Arc::new(LocalHub::new()),
            client,
            publisher,
            prefix: prefix.into(),
        })
    }

    pub fn channel(&self, topic: Topic) -> String {
        channel_name(&self.prefix, topic)
    }

    /// Starts relaying Redis messages into the local hub until `shutdown` flips
    /// to true (or its sender goes away).
    pub fn spawn_listener(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(listen(self.client.clone(), self.hub.clone(), self.prefix.clone(), shutdown))
    }
}

#[async_trait]
impl BroadcastFabric for RedisFabric {
    fn subscribe(&self, topic: Topic, sink: Sink) -> SinkId {
        self.hub.subscribe(topic, sink)
    }

    fn unsubscribe(&self, topic: Topic, sink: SinkId) {
        self.hub.unsubscribe(topic, sink)
    }

    async fn publish(&self, topic: Topic, envelope: Envelope) -> Result<(), FabricError> {
        let payload = serde_json::to_string(&envelope)?;
        let mut conn = self.publisher.clone();
        let listeners: i64 = conn.publish(self.channel(topic), payload).await?;
        debug!(%topic, listeners, "envelope published");
        Ok(())
    }

    fn local_subscribers(&self, topic: Topic) -> usize {
        self.hub.subscribers(topic)
    }
}

fn channel_name(prefix: &str, topic: Topic) -> String {
    format!("{prefix}.{topic}")
}

fn topic_from_channel(prefix: &str, channel: &str) -> Option<Topic> {
    channel.strip_prefix(prefix)?.strip_prefix('.')?.parse().ok()
}

async fn listen(
    client: ::redis::Client,
    hub: Arc<LocalHub>,
    prefix: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new();
    while !*shutdown.borrow() {
        match relay(&client, &hub, &prefix, &mut shutdown, &mut backoff).await {
            Ok(()) => break,
            Err(e) => {
                let delay = backoff.next_delay();
                let retry_in_ms = delay.as_millis() as u64;
                warn!(error = %e, retry_in_ms, "fabric listener lost redis");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }
    info!("fabric listener stopped");
}

async fn relay(
    client: &::redis::Client,
    hub: &LocalHub,
    prefix: &str,
    shutdown: &mut watch::Receiver<bool>,
    backoff: &mut Backoff,
) -> Result<(), FabricError> {
    let pattern = format!("{prefix}.*");
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.psubscribe(&pattern).await?;
    backoff.reset();
    info!(%pattern, "fabric listener subscribed");

    let mut messages = pubsub.on_message();
    loop {
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            message = messages.next() => {
                let Some(message) = message else {
                    return Err(FabricError::Disconnected);
                };
                dispatch(hub, prefix, &message);
            }
        }
    }
}

fn dispatch(hub: &LocalHub, prefix: &str, message: &Msg) {
    let channel = message.get_channel_name();
    let Some(topic) = topic_from_channel(prefix, channel) else {
        warn!(%channel, "ignoring message on unexpected channel");
        return;
    };

    let envelope = message
        .get_payload::<String>()
        .map_err(FabricError::from)
        .and_then(|payload| serde_json::from_str::<Envelope>(&payload).map_err(FabricError::from));
    match envelope {
        Ok(envelope) => {
            let delivered = hub.deliver(topic, envelope);
            debug!(%topic, delivered, "envelope relayed");
        }
        Err(e) => warn!(%channel, error = %e, "dropping undecodable envelope"),
    }
}

/// Exponential reconnect delay with up to 25% random jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new() -> Backoff {
        Backoff::with_bounds(Duration::from_millis(100), Duration::from_secs(30))
    }

    pub fn with_bounds(base: Duration, max: Duration) -> Backoff {
        Backoff { base, max, current: base }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);

        let jitter_ms = rand::rng().random_range(0..=delay.as_millis() as u64 / 4);
        delay + Duration::from_millis(jitter_ms)
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
