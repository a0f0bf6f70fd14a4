//! Maintenance technicians.

use std::sync::Arc;

use super::STATUS_FIELD;
use crate::cache::Sourced;
use crate::error::{StoreError, StoreResult};
use crate::record::{Collection, Fields, Filter, Record};
use crate::store::RecordStore;
use crate::subscription::{ChangeObserver, SubscriptionHandle};

pub const AREA: &str = "area";
pub const AVAILABLE_FLAG: &str = "available";

/// Status value of a technician free to take work.
pub const AVAILABLE: &str = "available";

pub async fn save_technician(
  store: &RecordStore,
  id: &str,
  data: Fields,
) -> StoreResult<Sourced<Record>> {
  if id.trim().is_empty() {
    return Err(StoreError::Validation("technician id is required".into()));
  }
  store.save(Collection::Technicians, Some(id), data).await
}

pub async fn technicians_by_area(
  store: &RecordStore,
  area: &str,
) -> StoreResult<Sourced<Vec<Record>>> {
  store
    .list(Collection::Technicians, &[Filter::eq(AREA, area)])
    .await
}

pub async fn available_technicians(store: &RecordStore) -> StoreResult<Sourced<Vec<Record>>> {
  store
    .list(Collection::Technicians, &[Filter::eq(STATUS_FIELD, AVAILABLE)])
    .await
}

/// Change a technician's status; the `available` flag follows it.
pub async fn set_technician_status(
  store: &RecordStore,
  id: &str,
  status: &str,
) -> StoreResult<Record> {
  let mut partial = Fields::new();
  partial.insert(STATUS_FIELD.into(), status.into());
  partial.insert(AVAILABLE_FLAG.into(), (status == AVAILABLE).into());
  store.update(Collection::Technicians, id, partial).await
}

pub async fn subscribe_technicians(
  store: &RecordStore,
  observer: Arc<dyn ChangeObserver>,
) -> StoreResult<SubscriptionHandle> {
  store
    .subscribe(Collection::Technicians, Vec::new(), observer)
    .await
}
