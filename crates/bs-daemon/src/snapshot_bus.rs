use std::sync::{Arc, Mutex, PoisonError};

use bs_core::types::AggregateState;

/// Fan-out of published snapshots to downstream publishers.
///
/// Each [`subscribe`](Self::subscribe) call returns a receiver that gets
/// every snapshot published afterwards. The daemon publishes once at
/// startup (when data exists) and after every cycle; what a subscriber does
/// with a snapshot (MQTT, webhooks, ...) is its own business.
#[derive(Clone, Default)]
pub struct SnapshotBus {
    subscribers: Arc<Mutex<Vec<flume::Sender<Arc<AggregateState>>>>>,
}

impl SnapshotBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> flume::Receiver<Arc<AggregateState>> {
        let (tx, rx) = flume::unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Send `snapshot` to every live subscriber, dropping the ones whose
    /// receiver is gone. Returns how many received it.
    pub fn publish(&self, snapshot: Arc<AggregateState>) -> usize {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(Arc::clone(&snapshot)).is_ok());
        tracing::debug!(subscribers = subscribers.len(), "snapshot published");
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_gets_the_same_snapshot() {
        let bus = SnapshotBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        let snapshot = Arc::new(AggregateState::default());
        assert_eq!(bus.publish(Arc::clone(&snapshot)), 2);

        assert!(Arc::ptr_eq(&a.try_recv().unwrap(), &snapshot));
        assert!(Arc::ptr_eq(&b.try_recv().unwrap(), &snapshot));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = SnapshotBus::new();
        let keep = bus.subscribe();
        drop(bus.subscribe());

        assert_eq!(bus.publish(Arc::new(AggregateState::default())), 1);
        assert_eq!(bus.subscriber_count(), 1);
        assert!(keep.try_recv().is_ok());
    }

    #[test]
    fn late_subscriber_misses_earlier_snapshots() {
        let bus = SnapshotBus::new();
        bus.publish(Arc::new(AggregateState::default()));
        let late = bus.subscribe();
        assert!(late.try_recv().is_err());
    }
}
