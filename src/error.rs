//! Error types surfaced by the record store and its remote adapter.

use thiserror::Error;

use crate::record::Collection;

/// Errors returned by the public record store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
  /// Network or transport failure talking to the remote store.
  #[error("remote store unavailable: {0}")]
  RemoteUnavailable(String),

  #[error("record not found: {collection}/{id}")]
  NotFound { collection: Collection, id: String },

  /// Malformed input, e.g. an empty id on update.
  #[error("validation failed: {0}")]
  Validation(String),

  /// The durable offline queue could not be written or read.
  #[error("offline queue failure: {0}")]
  QueueExhausted(String),

  /// The remote store refused the request (permission, conflict, ...).
  #[error("remote store rejected request: {0}")]
  Rejected(String),
}

impl StoreError {
  /// Whether this error is caused by missing connectivity rather than by the remote itself.
  pub fn is_unavailable(&self) -> bool {
    matches!(self, StoreError::RemoteUnavailable(_))
  }
}

/// Result type for record store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors reported by a [`RemoteStore`](crate::remote::RemoteStore) implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
  #[error("unavailable: {0}")]
  Unavailable(String),

  #[error("request timed out after {0} ms")]
  Timeout(u64),

  #[error("document {0} does not exist")]
  NotFound(String),

  #[error("rejected: {0}")]
  Rejected(String),
}

/// Result type for remote adapter calls.
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

impl RemoteError {
  /// Convert into a [`StoreError`] scoped to the collection the call targeted.
  pub fn into_store(self, collection: Collection) -> StoreError {
    match self {
      RemoteError::Unavailable(msg) => StoreError::RemoteUnavailable(msg),
      RemoteError::Timeout(ms) => {
        StoreError::RemoteUnavailable(format!("request timed out after {} ms", ms))
      }
      RemoteError::NotFound(id) => StoreError::NotFound { collection, id },
      RemoteError::Rejected(msg) => StoreError::Rejected(msg),
    }
  }
}
