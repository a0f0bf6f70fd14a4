//! Store-wide notifications fanned out to any number of listeners.

use tokio::sync::broadcast;

use crate::connectivity::Connectivity;
use crate::error::StoreError;
use crate::queue::DrainReport;
use crate::record::{ChangeSet, Collection};

/// Notifications published by a record store
#[derive(Debug, Clone)]
pub enum StoreEvent {
  /// Connectivity changed
  Connectivity(Connectivity),
  /// A write was stored in the offline queue and awaits sync
  Queued {
    collection: Collection,
    id: String,
    key: String,
  },
  /// A drain pass finished, completely or not
  Drained(DrainReport),
  /// A realtime batch was applied to the cache
  Changed {
    collection: Collection,
    changes: ChangeSet,
  },
  /// A realtime subscription died
  SubscriptionFailed {
    collection: Collection,
    error: StoreError,
  },
}

/// Fan-out of [`StoreEvent`]s to any number of listeners
#[derive(Debug, Clone)]
pub struct EventBus {
  tx: broadcast::Sender<StoreEvent>,
}

impl EventBus {
  /// Create a bus that buffers up to `capacity` events per lagging listener
  pub fn new(capacity: usize) -> Self {
    let (tx, _) = broadcast::channel(capacity.max(1));
    Self { tx }
  }

  /// Publish an event; it is dropped when nobody listens
  pub fn publish(&self, event: StoreEvent) {
    let _ = self.tx.send(event);
  }

  pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
    self.tx.subscribe()
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new(256)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_publish_reaches_every_listener() {
    let bus = EventBus::default();
    let mut a = bus.subscribe();
    let mut b = bus.subscribe();

    bus.publish(StoreEvent::Connectivity(Connectivity::Offline));

    for rx in [&mut a, &mut b] {
      match rx.recv().await.unwrap() {
        StoreEvent::Connectivity(state) => assert_eq!(state, Connectivity::Offline),
        other => panic!("unexpected event {:?}", other),
      }
    }
  }

  #[test]
  fn test_publish_without_listeners_is_dropped() {
    let bus = EventBus::new(0);
    bus.publish(StoreEvent::Connectivity(Connectivity::Online));
  }
}
