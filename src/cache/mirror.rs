//! In-memory mirror cache keyed by (collection, id).

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::record::{Collection, Record};

type Entries = HashMap<Collection, HashMap<String, CachedRecord>>;

/// A single cached record.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedRecord {
  /// The cached record
  pub record: Record,
  /// When the record was cached
  pub cached_at: DateTime<Utc>,
}

/// Process-local mirror of the remote collections.
///
/// Unbounded for the lifetime of a session; there is no eviction.
#[derive(Debug, Default)]
pub struct MirrorCache {
  entries: RwLock<Entries>,
}

impl MirrorCache {
  pub fn new() -> Self {
    Self::default()
  }

  // A panic while holding the lock cannot leave a map half-written, so poisoning is ignored.
  fn read(&self) -> RwLockReadGuard<'_, Entries> {
    self.entries.read().unwrap_or_else(PoisonError::into_inner)
  }

  fn write(&self) -> RwLockWriteGuard<'_, Entries> {
    self.entries.write().unwrap_or_else(PoisonError::into_inner)
  }

  /// Store a record under its id.
  ///
  /// Returns `false` when the record was ignored because the cached copy has a
  /// higher `version`.
  pub fn put(&self, collection: Collection, record: Record) -> bool {
    let mut entries = self.write();
    let records = entries.entry(collection).or_default();

    if let Some(existing) = records.get(&record.id) {
      if record.version < existing.record.version {
        tracing::debug!(
          %collection,
          id = %record.id,
          cached = existing.record.version,
          incoming = record.version,
          "ignoring older record version"
        );
        return false;
      }
    }

    records.insert(
      record.id.clone(),
      CachedRecord {
        record,
        cached_at: Utc::now(),
      },
    );
    true
  }

  pub fn get(&self, collection: Collection, id: &str) -> Option<Record> {
    self.get_entry(collection, id).map(|e| e.record)
  }

  pub fn get_entry(&self, collection: Collection, id: &str) -> Option<CachedRecord> {
    self
      .read()
      .get(&collection)
      .and_then(|records| records.get(id))
      .cloned()
  }

  /// Remove a record. Removing an absent record is a no-op.
  pub fn remove(&self, collection: Collection, id: &str) -> Option<Record> {
    self
      .write()
      .get_mut(&collection)
      .and_then(|records| records.remove(id))
      .map(|e| e.record)
  }

  /// All cached records of a collection, in no particular order.
  pub fn list(&self, collection: Collection) -> Vec<Record> {
    self
      .read()
      .get(&collection)
      .map(|records| records.values().map(|e| e.record.clone()).collect())
      .unwrap_or_default()
  }

  /// Oldest `cached_at` across a collection, used to date list fallbacks.
  pub fn oldest_cached_at(&self, collection: Collection) -> Option<DateTime<Utc>> {
    self
      .read()
      .get(&collection)
      .and_then(|records| records.values().map(|e| e.cached_at).min())
  }

  pub fn count(&self, collection: Collection) -> usize {
    self.read().get(&collection).map_or(0, HashMap::len)
  }

  pub fn clear(&self) {
    self.write().clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::record::fields;
  use serde_json::json;

  fn request(id: &str, version: u64, status: &str) -> Record {
    Record::new(id, fields(json!({"status": status}))).with_version(version)
  }

  #[test]
  fn test_put_and_get() {
    let cache = MirrorCache::new();
    assert!(cache.put(Collection::Requests, request("R1", 1, "PENDING")));

    let cached = cache.get(Collection::Requests, "R1").unwrap();
    assert_eq!(cached.fields["status"], "PENDING");
    // same id in another collection is a different record
    assert!(cache.get(Collection::Technicians, "R1").is_none());
  }

  #[test]
  fn test_lower_version_is_ignored() {
    let cache = MirrorCache::new();
    cache.put(Collection::Requests, request("R1", 3, "ASSIGNED"));

    assert!(!cache.put(Collection::Requests, request("R1", 2, "PENDING")));
    assert_eq!(
      cache.get(Collection::Requests, "R1").unwrap().fields["status"],
      "ASSIGNED"
    );

    // equal version overwrites
    assert!(cache.put(Collection::Requests, request("R1", 3, "DONE")));
    assert_eq!(
      cache.get(Collection::Requests, "R1").unwrap().fields["status"],
      "DONE"
    );
  }

  #[test]
  fn test_single_entry_per_id() {
    let cache = MirrorCache::new();
    for version in 1..=5 {
      cache.put(Collection::Requests, request("R1", version, "PENDING"));
    }
    assert_eq!(cache.count(Collection::Requests), 1);
    assert_eq!(cache.get(Collection::Requests, "R1").unwrap().version, 5);
  }

  #[test]
  fn test_remove_absent_is_noop() {
    let cache = MirrorCache::new();
    assert!(cache.remove(Collection::Requests, "missing").is_none());

    cache.put(Collection::Requests, request("R1", 1, "PENDING"));
    assert!(cache.remove(Collection::Requests, "R1").is_some());
    assert!(cache.remove(Collection::Requests, "R1").is_none());
    assert!(cache.get(Collection::Requests, "R1").is_none());
  }

  #[test]
  fn test_list_and_clear() {
    let cache = MirrorCache::new();
    cache.put(Collection::Requests, request("R1", 1, "PENDING"));
    cache.put(Collection::Requests, request("R2", 1, "PENDING"));
    cache.put(Collection::Technicians, request("T1", 1, "available"));

    let mut ids: Vec<String> = cache
      .list(Collection::Requests)
      .into_iter()
      .map(|r| r.id)
      .collect();
    ids.sort();
    assert_eq!(ids, vec!["R1", "R2"]);
    assert!(cache.oldest_cached_at(Collection::Requests).is_some());
    assert!(cache.list(Collection::ApprovedUsers).is_empty());

    cache.clear();
    assert_eq!(cache.count(Collection::Requests), 0);
    assert_eq!(cache.count(Collection::Technicians), 0);
  }
}
