//! Hospital-specific operations composed from the generic [`RecordStore`].
//!
//! Each module only fixes collection names and field contracts; all cache,
//! queue and fallback behavior comes from the store.
//!
//! [`RecordStore`]: crate::store::RecordStore

pub mod legacy;
pub mod requests;
pub mod technicians;
pub mod users;

/// Lifecycle field shared by requests, technicians and access requests.
pub const STATUS_FIELD: &str = "status";

pub const PENDING: &str = "PENDING";

#[cfg(test)]
pub(crate) fn test_store() -> (
  std::sync::Arc<crate::remote::MemoryRemote>,
  crate::store::RecordStore,
) {
  use crate::queue::{MemoryQueue, OfflineQueue};
  use crate::store::{RecordStore, StoreOptions};

  let remote = std::sync::Arc::new(crate::remote::MemoryRemote::new());
  let store = RecordStore::new(
    remote.clone(),
    OfflineQueue::new(MemoryQueue::new()),
    StoreOptions::default(),
  );
  (remote, store)
}
