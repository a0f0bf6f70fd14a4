//! Remote document store capability.
//!
//! The record store only talks to the remote database through [`RemoteStore`],
//! so any backend (a cloud document database client, an HTTP gateway, the
//! in-memory [`MemoryRemote`]) can be injected.

mod memory;

pub use memory::{MemoryRemote, RemoteCall, RemoteOp};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{RemoteError, RemoteResult};
use crate::record::{ChangeKind, Collection, Fields, Filter, OrderBy, Record};

/// One changed record in a realtime batch.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
  pub kind: ChangeKind,
  pub record: Record,
}

impl RemoteChange {
  pub fn new(kind: ChangeKind, record: Record) -> Self {
    Self { kind, record }
  }
}

/// Message delivered on a realtime subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
  /// Changes in the order the transport observed them
  Batch(Vec<RemoteChange>),
  /// The transport failed; no further events follow
  Error(RemoteError),
}

/// Receiving end of a realtime subscription. Dropping it cancels the subscription.
pub type ChangeStream = mpsc::UnboundedReceiver<RemoteEvent>;

/// Operations the remote document store must provide.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
  /// Read one record; `Ok(None)` when it does not exist.
  async fn get(&self, collection: Collection, id: &str) -> RemoteResult<Option<Record>>;

  async fn list(
    &self,
    collection: Collection,
    filters: &[Filter],
    order: &OrderBy,
  ) -> RemoteResult<Vec<Record>>;

  /// Write the full record at `record.id`. The server assigns `lastUpdated`.
  async fn put(&self, collection: Collection, record: Record) -> RemoteResult<Record>;

  /// Create a record. The server assigns the id (ignoring `record.id`) and `lastUpdated`.
  async fn create(&self, collection: Collection, record: Record) -> RemoteResult<Record>;

  /// Merge `partial` into an existing record and set its version.
  ///
  /// Fails with [`RemoteError::NotFound`] when the record does not exist.
  async fn update(
    &self,
    collection: Collection,
    id: &str,
    version: u64,
    partial: Fields,
  ) -> RemoteResult<Record>;

  async fn delete(&self, collection: Collection, id: &str) -> RemoteResult<()>;

  /// Start a realtime listener on the records matching `filters`.
  async fn subscribe(&self, collection: Collection, filters: &[Filter])
    -> RemoteResult<ChangeStream>;
}
