use async_trait::async_trait;

use super::{BroadcastFabric, Envelope, FabricError, LocalHub, Sink, SinkId, Topic};

/// Fanout for a single gateway process.
#[derive(Default)]
pub struct InProcessFabric {
    hub: LocalHub,
}

impl InProcessFabric {
    pub fn new() -> InProcessFabric {
        InProcessFabric::default()
    }
}

#[async_trait]
impl BroadcastFabric for InProcessFabric {
    fn subscribe(&self, topic: Topic, sink: Sink) -> SinkId {
        self.hub.subscribe(topic, sink)
    }

    fn unsubscribe(&self, topic: Topic, sink: SinkId) {
        self.hub.unsubscribe(topic, sink)
    }

    async fn publish(&self, topic: Topic, envelope: Envelope) -> Result<(), FabricError> {
        self.hub.deliver(topic, envelope);
        Ok(())
    }

    fn local_subscribers(&self, topic: Topic) -> usize {
        self.hub.subscribers(topic)
    }
}
