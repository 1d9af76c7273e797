use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use dashmap::{mapref::entry::Entry, DashMap};
use tracing::debug;

use super::{Envelope, Sink, Topic};

pub type SinkId = u64;

/// The sinks of this process's connections, grouped by topic.
#[derive(Default)]
pub struct LocalHub {
    topics: DashMap<Topic, HashMap<SinkId, Sink>>,
    next_sink: AtomicU64,
}

impl LocalHub {
    pub fn new() -> LocalHub {
        LocalHub::default()
    }

    pub fn subscribe(&self, topic: Topic, sink: Sink) -> SinkId {
        let id = self.next_sink.fetch_add(1, Ordering::Relaxed);
        self.topics.entry(topic).or_default().insert(id, sink);
        debug!(%topic, sink = id, "sink subscribed");
        id
    }

    pub fn unsubscribe(&self, topic: Topic, sink: SinkId) {
        if let Entry::Occupied(mut sinks) = self.topics.entry(topic) {
            if sinks.get_mut().remove(&sink).is_some() {
                debug!(%topic, sink, "sink unsubscribed");
            }
            if sinks.get().is_empty() {
                sinks.remove();
            }
        }
    }

    /// Hands `envelope` to every sink under `topic` and returns how many took it.
    ///
    /// The topic's entry is held exclusively for the whole fanout, so two
    /// concurrent deliveries reach every sink in the same order.
    pub fn deliver(&self, topic: Topic, envelope: Envelope) -> usize {
        let Some(sinks) = self.topics.get_mut(&topic) else {
            return 0;
        };

        let envelope = Arc::new(envelope);
        sinks
            .values()
            .filter(|sink| sink.send(envelope.clone()).is_ok())
            .count()
    }

    pub fn subscribers(&self, topic: Topic) -> usize {
        self.topics.get(&topic).map_or(0, |sinks| sinks.len())
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}
