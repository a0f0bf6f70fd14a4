//! Maintenance requests.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;

use super::{PENDING, STATUS_FIELD};
use crate::cache::Sourced;
use crate::error::{StoreError, StoreResult};
use crate::record::{Collection, Fields, Filter, Record};
use crate::store::RecordStore;
use crate::subscription::{ChangeObserver, SubscriptionHandle};

pub const ENGINEERING_SERVICE: &str = "engineeringService";
pub const REQUESTER_EMAIL: &str = "requesterEmail";
pub const MANAGEMENT_STATUS: &str = "managementStatus";
pub const CREATED_AT: &str = "createdAt";
pub const ASSIGNED_TECHNICIAN: &str = "assignedTechnician";
pub const ASSIGNED_TECHNICIAN_ID: &str = "assignedTechnicianId";
pub const ASSIGNED_AT: &str = "assignedAt";

pub const ASSIGNED: &str = "ASSIGNED";

/// Technician picked for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignee {
  pub id: String,
  pub name: String,
}

/// Store a new request under its request number, stamped as pending.
pub async fn save_request(
  store: &RecordStore,
  number: &str,
  mut data: Fields,
) -> StoreResult<Sourced<Record>> {
  if number.trim().is_empty() {
    return Err(StoreError::Validation("request number is required".into()));
  }
  data.insert(CREATED_AT.into(), Value::String(Utc::now().to_rfc3339()));
  data.insert(STATUS_FIELD.into(), PENDING.into());
  data.insert(MANAGEMENT_STATUS.into(), PENDING.into());

  store.save(Collection::Requests, Some(number), data).await
}

pub async fn requests_by_area(store: &RecordStore, area: &str) -> StoreResult<Sourced<Vec<Record>>> {
  store
    .list(Collection::Requests, &[Filter::eq(ENGINEERING_SERVICE, area)])
    .await
}

pub async fn requests_by_requester(
  store: &RecordStore,
  email: &str,
) -> StoreResult<Sourced<Vec<Record>>> {
  store
    .list(Collection::Requests, &[Filter::eq(REQUESTER_EMAIL, email)])
    .await
}

pub async fn assign_technician(
  store: &RecordStore,
  number: &str,
  technician: &Assignee,
) -> StoreResult<Record> {
  let mut partial = Fields::new();
  partial.insert(ASSIGNED_TECHNICIAN.into(), technician.name.clone().into());
  partial.insert(ASSIGNED_TECHNICIAN_ID.into(), technician.id.clone().into());
  partial.insert(MANAGEMENT_STATUS.into(), ASSIGNED.into());
  partial.insert(ASSIGNED_AT.into(), Utc::now().to_rfc3339().into());

  store.update(Collection::Requests, number, partial).await
}

pub async fn subscribe_requests(
  store: &RecordStore,
  observer: Arc<dyn ChangeObserver>,
) -> StoreResult<SubscriptionHandle> {
  store.subscribe(Collection::Requests, Vec::new(), observer).await
}
