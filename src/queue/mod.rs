//! Durable queue of writes made while offline.
//!
//! Writes are appended in order and replayed strictly FIFO on reconnect.
//! Draining stops at the first failure so that writes are never applied
//! out of order; the failed entry and everything behind it stay queued.

mod offline;
mod storage;

pub use offline::{AppliedWrite, DrainHalt, DrainReport, OfflineQueue};
pub use storage::{MemoryQueue, QueueStorage, SqliteQueue};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::record::{Collection, Fields};

/// Kind of write captured in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteOp {
  Save,
}

/// A write waiting to be applied to the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingWrite {
  pub collection: Collection,
  /// Target id; `None` asks the remote store to assign one on flush
  pub id: Option<String>,
  /// Placeholder id held by the mirror cache until the write is confirmed
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub local_id: Option<String>,
  pub data: Fields,
  /// When the write was enqueued
  pub timestamp: DateTime<Utc>,
  pub operation: WriteOp,
}

impl PendingWrite {
  pub fn save(collection: Collection, id: Option<String>, data: Fields) -> Self {
    Self {
      collection,
      id,
      local_id: None,
      data,
      timestamp: Utc::now(),
      operation: WriteOp::Save,
    }
  }

  pub fn with_local_id(mut self, local_id: impl Into<String>) -> Self {
    self.local_id = Some(local_id.into());
    self
  }

  /// The id this write is known under locally: the target id or the placeholder.
  pub fn effective_id(&self) -> Option<&str> {
    self.id.as_deref().or(self.local_id.as_deref())
  }

  /// Generate a queue key embedding collection, target and enqueue time.
  ///
  /// A random suffix keeps keys unique when the same record is written twice
  /// within one timestamp tick.
  pub fn entry_key(&self) -> String {
    let nonce = Uuid::new_v4().simple().to_string();
    format!(
      "offline_{}_{}_{}_{}",
      self.collection,
      self.effective_id().unwrap_or("new"),
      self.timestamp.timestamp_micros(),
      &nonce[..8]
    )
  }
}

/// A pending write as stored in the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedWrite {
  pub key: String,
  pub write: PendingWrite,
  /// Failed drain attempts so far
  pub attempts: u32,
}
