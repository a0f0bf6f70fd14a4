//! Offline write queue with FIFO drain.

use std::future::Future;
use tokio::sync::Mutex;

use super::storage::QueueStorage;
use super::{PendingWrite, QueuedWrite};
use crate::error::{StoreError, StoreResult};
use crate::record::{Collection, Record};

/// A queued write confirmed by the remote store during a drain.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedWrite {
  pub key: String,
  pub collection: Collection,
  /// The server-confirmed record
  pub record: Record,
}

/// Why a drain stopped before emptying the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum DrainHalt {
  /// The entry failed and stays queued for the next reconnect
  Failed {
    key: String,
    error: StoreError,
    attempts: u32,
  },
  /// The entry failed for the last allowed time and was removed
  Discarded {
    key: String,
    write: PendingWrite,
    error: StoreError,
    attempts: u32,
  },
  /// Connectivity was lost mid-drain
  WentOffline,
  /// The queue storage itself failed
  Storage(String),
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
  pub applied: Vec<AppliedWrite>,
  pub halted: Option<DrainHalt>,
  /// Entries still queued after the pass
  pub remaining: usize,
}

impl DrainReport {
  /// Whether the pass emptied the queue without hitting a failure.
  pub fn is_complete(&self) -> bool {
    self.halted.is_none()
  }
}

/// Ordered log of writes made while offline.
pub struct OfflineQueue {
  storage: Box<dyn QueueStorage>,
  /// Held for the duration of a drain so that passes never overlap
  draining: Mutex<()>,
  max_attempts: u32,
}

impl OfflineQueue {
  pub fn new(storage: impl QueueStorage + 'static) -> Self {
    Self {
      storage: Box::new(storage),
      draining: Mutex::new(()),
      max_attempts: 3,
    }
  }

  /// Number of failed drains after which an entry is discarded and reported.
  pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
    self.max_attempts = max_attempts.max(1);
    self
  }

  /// Append a write. Returns the generated offline-entry key.
  pub fn enqueue(&self, write: PendingWrite) -> StoreResult<String> {
    let key = write.entry_key();
    self
      .storage
      .append(&key, &write)
      .map_err(|e| StoreError::QueueExhausted(e.to_string()))?;

    tracing::info!(
      key = %key,
      collection = %write.collection,
      id = write.effective_id().unwrap_or("<new>"),
      "queued offline write"
    );
    Ok(key)
  }

  pub fn entries(&self) -> StoreResult<Vec<QueuedWrite>> {
    self
      .storage
      .entries()
      .map_err(|e| StoreError::QueueExhausted(e.to_string()))
  }

  pub fn len(&self) -> StoreResult<usize> {
    self
      .storage
      .len()
      .map_err(|e| StoreError::QueueExhausted(e.to_string()))
  }

  pub fn is_empty(&self) -> StoreResult<bool> {
    Ok(self.len()? == 0)
  }

  /// Explicitly drop an entry. Returns whether it existed.
  pub fn discard(&self, key: &str) -> StoreResult<bool> {
    let removed = self
      .storage
      .remove(key)
      .map_err(|e| StoreError::QueueExhausted(e.to_string()))?;
    if removed {
      tracing::warn!(key = %key, "discarded offline write");
    }
    Ok(removed)
  }

  /// Whether a drain pass is currently running.
  pub fn is_draining(&self) -> bool {
    self.draining.try_lock().is_err()
  }

  /// Replay queued writes in enqueue order, one at a time.
  ///
  /// `apply` performs the remote write and returns the confirmed record; the
  /// entry is removed only after it succeeds. The first failure stops the pass.
  /// `online` is checked before every entry.
  ///
  /// Returns `None` when another drain is already running.
  pub async fn drain<F, Fut>(&self, mut apply: F, online: impl Fn() -> bool) -> Option<DrainReport>
  where
    F: FnMut(PendingWrite) -> Fut,
    Fut: Future<Output = StoreResult<Record>>,
  {
    let Ok(_guard) = self.draining.try_lock() else {
      tracing::debug!("drain already in progress");
      return None;
    };

    let mut report = DrainReport::default();

    loop {
      if !online() {
        report.halted = Some(DrainHalt::WentOffline);
        break;
      }

      let entry = match self.storage.front() {
        Ok(Some(entry)) => entry,
        Ok(None) => break,
        Err(e) => {
          report.halted = Some(DrainHalt::Storage(e.to_string()));
          break;
        }
      };

      let collection = entry.write.collection;
      match apply(entry.write.clone()).await {
        Ok(record) => {
          if let Err(e) = self.storage.remove(&entry.key) {
            // The write landed remotely but is still queued; it will be replayed.
            report.halted = Some(DrainHalt::Storage(e.to_string()));
            break;
          }
          tracing::info!(key = %entry.key, %collection, id = %record.id, "replayed offline write");
          report.applied.push(AppliedWrite {
            key: entry.key,
            collection,
            record,
          });
        }
        Err(error) => {
          report.halted = Some(self.fail(entry, error));
          break;
        }
      }
    }

    report.remaining = self.storage.len().unwrap_or_else(|e| {
      tracing::warn!("failed to count offline entries: {}", e);
      0
    });

    match &report.halted {
      None => tracing::info!(applied = report.applied.len(), "offline queue drained"),
      Some(halt) => tracing::warn!(
        applied = report.applied.len(),
        remaining = report.remaining,
        ?halt,
        "offline queue drain halted"
      ),
    }

    Some(report)
  }

  fn fail(&self, entry: QueuedWrite, error: StoreError) -> DrainHalt {
    let attempts = match self.storage.record_failure(&entry.key) {
      Ok(attempts) => attempts,
      Err(e) => return DrainHalt::Storage(e.to_string()),
    };

    if attempts < self.max_attempts {
      return DrainHalt::Failed {
        key: entry.key,
        error,
        attempts,
      };
    }

    if let Err(e) = self.storage.remove(&entry.key) {
      return DrainHalt::Storage(e.to_string());
    }
    tracing::error!(
      key = %entry.key,
      attempts,
      %error,
      "discarding offline write after exhausting retries"
    );
    DrainHalt::Discarded {
      key: entry.key,
      write: entry.write,
      error,
      attempts,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::queue::{MemoryQueue, SqliteQueue};
  use crate::record::{fields, Fields};
  use serde_json::json;
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::{Arc, Mutex as StdMutex};

  fn write(id: &str) -> PendingWrite {
    PendingWrite::save(
      Collection::Requests,
      Some(id.to_string()),
      fields(json!({"status": "PENDING"})),
    )
  }

  fn confirmed(write: &PendingWrite) -> Record {
    Record::new(write.id.clone().unwrap_or_default(), write.data.clone()).with_version(1)
  }

  #[tokio::test]
  async fn test_drain_applies_in_enqueue_order() {
    let queue = OfflineQueue::new(MemoryQueue::new());
    queue.enqueue(write("W1")).unwrap();
    queue.enqueue(write("W2")).unwrap();
    queue.enqueue(write("W3")).unwrap();

    let calls = Arc::new(StdMutex::new(Vec::new()));
    let log = calls.clone();
    let report = queue
      .drain(
        move |w| {
          log.lock().unwrap().push(w.id.clone().unwrap());
          async move { Ok::<_, StoreError>(confirmed(&w)) }
        },
        || true,
      )
      .await
      .unwrap();

    assert!(report.is_complete());
    assert_eq!(report.applied.len(), 3);
    assert_eq!(report.remaining, 0);
    assert_eq!(*calls.lock().unwrap(), vec!["W1", "W2", "W3"]);
    assert!(queue.is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_drain_halts_on_first_failure() {
    let queue = OfflineQueue::new(SqliteQueue::open_in_memory().unwrap());
    queue.enqueue(write("W1")).unwrap();
    queue.enqueue(write("W2")).unwrap();
    queue.enqueue(write("W3")).unwrap();

    let calls = Arc::new(StdMutex::new(Vec::new()));
    let log = calls.clone();
    let report = queue
      .drain(
        move |w| {
          let id = w.id.clone().unwrap();
          log.lock().unwrap().push(id.clone());
          async move {
            if id == "W2" {
              Err(StoreError::RemoteUnavailable("connection reset".into()))
            } else {
              Ok::<_, StoreError>(confirmed(&w))
            }
          }
        },
        || true,
      )
      .await
      .unwrap();

    // W3 was never attempted
    assert_eq!(*calls.lock().unwrap(), vec!["W1", "W2"]);
    assert_eq!(report.applied.len(), 1);
    assert_eq!(report.remaining, 2);
    assert!(matches!(
      report.halted,
      Some(DrainHalt::Failed { attempts: 1, .. })
    ));

    let remaining: Vec<Option<String>> = queue
      .entries()
      .unwrap()
      .into_iter()
      .map(|e| e.write.id)
      .collect();
    assert_eq!(remaining, vec![Some("W2".into()), Some("W3".into())]);
  }

  #[tokio::test]
  async fn test_entry_discarded_after_max_attempts() {
    let queue = OfflineQueue::new(MemoryQueue::new()).with_max_attempts(2);
    queue.enqueue(write("W1")).unwrap();
    queue.enqueue(write("W2")).unwrap();

    let failing = |_w: PendingWrite| async {
      Err::<Record, _>(StoreError::Rejected("permission denied".into()))
    };

    let first = queue.drain(failing, || true).await.unwrap();
    assert!(matches!(first.halted, Some(DrainHalt::Failed { .. })));
    assert_eq!(first.remaining, 2);

    let second = queue.drain(failing, || true).await.unwrap();
    match second.halted {
      Some(DrainHalt::Discarded {
        write, attempts, ..
      }) => {
        assert_eq!(write.id.as_deref(), Some("W1"));
        assert_eq!(attempts, 2);
      }
      other => panic!("expected discard, got {:?}", other),
    }
    // the discarded entry is gone, the rest is untouched
    assert_eq!(second.remaining, 1);
    assert_eq!(queue.entries().unwrap()[0].write.id.as_deref(), Some("W2"));
  }

  #[tokio::test]
  async fn test_drain_stops_when_offline() {
    let queue = OfflineQueue::new(MemoryQueue::new());
    queue.enqueue(write("W1")).unwrap();
    queue.enqueue(write("W2")).unwrap();

    let online = Arc::new(AtomicBool::new(true));
    let flag = online.clone();
    let report = queue
      .drain(
        move |w| {
          // connectivity drops right after the first write lands
          flag.store(false, Ordering::SeqCst);
          async move { Ok::<_, StoreError>(confirmed(&w)) }
        },
        || online.load(Ordering::SeqCst),
      )
      .await
      .unwrap();

    assert_eq!(report.applied.len(), 1);
    assert_eq!(report.halted, Some(DrainHalt::WentOffline));
    assert_eq!(report.remaining, 1);
  }

  #[tokio::test]
  async fn test_enqueue_during_drain_is_replayed_after_cursor() {
    let queue = Arc::new(OfflineQueue::new(MemoryQueue::new()));
    queue.enqueue(write("W1")).unwrap();

    let calls = Arc::new(StdMutex::new(Vec::new()));
    let log = calls.clone();
    let inner = queue.clone();
    let report = queue
      .drain(
        move |w| {
          let id = w.id.clone().unwrap();
          if id == "W1" {
            inner.enqueue(write("W2")).unwrap();
          }
          log.lock().unwrap().push(id);
          async move { Ok::<_, StoreError>(confirmed(&w)) }
        },
        || true,
      )
      .await
      .unwrap();

    assert!(report.is_complete());
    assert_eq!(*calls.lock().unwrap(), vec!["W1", "W2"]);
  }

  #[tokio::test]
  async fn test_concurrent_drain_is_skipped() {
    let queue = Arc::new(OfflineQueue::new(MemoryQueue::new()));
    let write = PendingWrite::save(Collection::Technicians, None, Fields::new());
    queue.enqueue(write.with_local_id("local-1")).unwrap();

    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));

    let running = {
      let queue = queue.clone();
      tokio::spawn(async move {
        queue
          .drain(
            move |w| {
              let release_rx = release_rx.clone();
              async move {
                if let Some(rx) = release_rx.lock().await.take() {
                  let _ = rx.await;
                }
                Ok::<_, StoreError>(Record::new("server-1", w.data))
              }
            },
            || true,
          )
          .await
      })
    };

    // wait until the first pass holds the drain lock
    while !queue.is_draining() {
      tokio::task::yield_now().await;
    }
    let skipped = queue
      .drain(
        |w: PendingWrite| async move { Ok::<_, StoreError>(Record::new("x", w.data)) },
        || true,
      )
      .await;
    assert!(skipped.is_none());

    release_tx.send(()).unwrap();
    let report = running.await.unwrap().unwrap();
    assert_eq!(report.applied[0].record.id, "server-1");
  }

  #[test]
  fn test_discard_is_explicit() {
    let queue = OfflineQueue::new(MemoryQueue::new());
    let key = queue.enqueue(write("R1")).unwrap();
    assert!(queue.discard(&key).unwrap());
    assert!(!queue.discard(&key).unwrap());
    assert_eq!(queue.len().unwrap(), 0);
  }
}
