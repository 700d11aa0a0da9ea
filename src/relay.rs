//! Shared relay context handed to every connection.

use std::sync::Arc;

use tracing::debug;

use crate::{
    bus::{Bus, EVENTS_TOPIC},
    error::RelayError,
    event::Event,
    storage::{Store, WriteOutcome},
    validation::Policy,
};

/// Store, bus and limits shared by all sessions.
pub struct Relay {
    pub store: Store,
    pub bus: Arc<dyn Bus>,
    pub policy: Policy,
    /// Capacity of each connection's outbound queue.
    pub outbound_buffer: usize,
}

impl Relay {
    pub fn new(store: Store, bus: Arc<dyn Bus>, policy: Policy, outbound_buffer: usize) -> Self {
        Self {
            store,
            bus,
            policy,
            outbound_buffer: outbound_buffer.max(1),
        }
    }

    /// Validate, apply the storage disposition, then publish to live
    /// subscribers. Duplicates are not republished.
    pub async fn submit(&self, ev: Event) -> Result<WriteOutcome, RelayError> {
        if let Err(e) = self.policy.validate(&ev) {
            debug!(id = %ev.id, error = %e, "event rejected");
            return Err(e.into());
        }
        let outcome = self.store.write(&ev).await?;
        if outcome.is_broadcast() {
            let delivered = self.bus.publish(EVENTS_TOPIC, Arc::new(ev))?;
            debug!(?outcome, delivered, "event published");
        }
        Ok(outcome)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::Relay;
    use crate::{bus::LocalBus, storage::Store, validation::Policy};

    /// Relay over a fresh on-disk database and an in-process bus.
    pub fn relay() -> (TempDir, Arc<LocalBus>, Arc<Relay>) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("relay.db"), 2, 500).unwrap();
        let bus = Arc::new(LocalBus::new(64));
        let relay = Relay::new(store, bus.clone(), Policy::default(), 64);
        (dir, bus, Arc::new(relay))
    }
}
