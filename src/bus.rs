//! Fan-out mailbox for accepted events, keyed by topic.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::{error::BusError, event::Event};

/// Topic every accepted event is published on.
pub const EVENTS_TOPIC: &str = "events";

/// Publish/subscribe collaborator.
pub trait Bus: Send + Sync {
    /// Deliver `payload` to current subscribers of `topic`, returning how many
    /// received it.
    fn publish(&self, topic: &str, payload: Arc<Event>) -> Result<usize, BusError>;

    /// Start receiving `topic`. The subscription is released when dropped.
    fn subscribe(&self, topic: &str) -> Result<BusSubscription, BusError>;
}

/// A live subscription to one topic.
pub struct BusSubscription {
    topic: String,
    rx: broadcast::Receiver<Arc<Event>>,
    live: Arc<AtomicUsize>,
}

impl BusSubscription {
    /// Next payload, or `None` once the topic is closed.
    ///
    /// A subscriber that falls behind skips the payloads it missed.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        loop {
            match self.rx.recv().await {
                Ok(ev) => return Some(ev),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(topic = %self.topic, skipped, "subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        debug!(topic = %self.topic, "bus subscription released");
    }
}

struct Topic {
    tx: broadcast::Sender<Arc<Event>>,
    live: Arc<AtomicUsize>,
}

/// In-process bus over tokio broadcast channels.
pub struct LocalBus {
    capacity: usize,
    topics: Mutex<HashMap<String, Topic>>,
    closed: AtomicBool,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Subscriptions currently held on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .map(|topics| topics.get(topic).map_or(0, |t| t.live.load(Ordering::Acquire)))
            .unwrap_or_default()
    }

    /// Close every topic; pending subscribers drain and then see the end.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Ok(mut topics) = self.topics.lock() {
            topics.clear();
        }
    }

    fn check_open(&self, topic: &str) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed(topic.to_string()));
        }
        Ok(())
    }
}

impl Bus for LocalBus {
    fn publish(&self, topic: &str, payload: Arc<Event>) -> Result<usize, BusError> {
        self.check_open(topic)?;
        let topics = self
            .topics
            .lock()
            .map_err(|_| BusError::Closed(topic.to_string()))?;
        // no receivers is not a failure
        Ok(topics
            .get(topic)
            .and_then(|t| t.tx.send(payload).ok())
            .unwrap_or(0))
    }

    fn subscribe(&self, topic: &str) -> Result<BusSubscription, BusError> {
        self.check_open(topic)?;
        let mut topics = self
            .topics
            .lock()
            .map_err(|_| BusError::Closed(topic.to_string()))?;
        let entry = topics.entry(topic.to_string()).or_insert_with(|| Topic {
            tx: broadcast::channel(self.capacity).0,
            live: Arc::new(AtomicUsize::new(0)),
        });
        entry.live.fetch_add(1, Ordering::AcqRel);
        Ok(BusSubscription {
            topic: topic.to_string(),
            rx: entry.tx.subscribe(),
            live: entry.live.clone(),
        })
    }
}
