//! Result wrapper describing where returned data came from.

use chrono::{DateTime, Utc};

/// Result from a store operation, including data and metadata about the source.
#[derive(Debug, Clone, PartialEq)]
pub struct Sourced<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: Source,
  /// When the data was cached (if served from the mirror cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> Sourced<T> {
  /// Data confirmed by the remote store.
  pub fn remote(data: T) -> Self {
    Self {
      data,
      source: Source::Remote,
      cached_at: None,
    }
  }

  /// Data served from the mirror cache because the remote store failed.
  pub fn fallback(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: Source::CacheFallback,
      cached_at,
    }
  }

  /// Data written locally and waiting in the offline queue.
  pub fn queued(data: T) -> Self {
    Self {
      data,
      source: Source::Queued,
      cached_at: Some(Utc::now()),
    }
  }

  /// Whether the data may lag behind the remote store.
  pub fn is_stale(&self) -> bool {
    self.source != Source::Remote
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Sourced<U> {
    Sourced {
      data: f(self.data),
      source: self.source,
      cached_at: self.cached_at,
    }
  }

  pub fn into_inner(self) -> T {
    self.data
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
  /// Fresh data from the remote store
  Remote,
  /// Remote call failed, serving the last-known cached data
  CacheFallback,
  /// Written while offline, not yet confirmed by the remote store
  Queued,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_staleness_by_source() {
    assert!(!Sourced::remote(1).is_stale());
    assert!(Sourced::fallback(1, None).is_stale());
    assert!(Sourced::queued(1).is_stale());
  }

  #[test]
  fn test_map_keeps_metadata() {
    let cached_at = Utc::now();
    let mapped = Sourced::fallback(vec![1, 2], Some(cached_at)).map(|v| v.len());
    assert_eq!(mapped.data, 2);
    assert_eq!(mapped.source, Source::CacheFallback);
    assert_eq!(mapped.cached_at, Some(cached_at));
  }
}
