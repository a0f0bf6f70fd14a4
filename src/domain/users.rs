//! Access requests and approved users.

use chrono::Utc;
use std::sync::Arc;

use super::{PENDING, STATUS_FIELD};
use crate::cache::Sourced;
use crate::error::{StoreError, StoreResult};
use crate::record::{Collection, Fields, Filter, Record};
use crate::store::RecordStore;
use crate::subscription::{ChangeObserver, SubscriptionHandle};

pub const EMAIL: &str = "email";
pub const APPROVED_AT: &str = "approvedAt";

pub const APPROVED: &str = "APPROVED";

pub async fn save_access_request(
  store: &RecordStore,
  id: &str,
  data: Fields,
) -> StoreResult<Sourced<Record>> {
  if id.trim().is_empty() {
    return Err(StoreError::Validation("access request id is required".into()));
  }
  store.save(Collection::AccessRequests, Some(id), data).await
}

/// Record `user` as approved, then mark its access request approved.
///
/// The approval update is never queued, so approving while offline fails
/// after the approved user itself was queued.
pub async fn approve_user(store: &RecordStore, id: &str, user: Fields) -> StoreResult<Sourced<Record>> {
  if id.trim().is_empty() {
    return Err(StoreError::Validation("user id is required".into()));
  }
  let approved = store.save(Collection::ApprovedUsers, Some(id), user).await?;

  let mut partial = Fields::new();
  partial.insert(STATUS_FIELD.into(), APPROVED.into());
  partial.insert(APPROVED_AT.into(), Utc::now().to_rfc3339().into());
  store
    .update(Collection::AccessRequests, id, partial)
    .await?;

  tracing::info!(%id, "user approved");
  Ok(approved)
}

/// First approved user with `email`, if any.
pub async fn user_by_email(store: &RecordStore, email: &str) -> StoreResult<Option<Record>> {
  let users = store
    .list(Collection::ApprovedUsers, &[Filter::eq(EMAIL, email)])
    .await?;
  Ok(users.into_inner().into_iter().next())
}

pub async fn pending_access_requests(store: &RecordStore) -> StoreResult<Sourced<Vec<Record>>> {
  store
    .list(Collection::AccessRequests, &[Filter::eq(STATUS_FIELD, PENDING)])
    .await
}

pub async fn subscribe_access_requests(
  store: &RecordStore,
  observer: Arc<dyn ChangeObserver>,
) -> StoreResult<SubscriptionHandle> {
  store
    .subscribe(Collection::AccessRequests, Vec::new(), observer)
    .await
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::test_store;
  use crate::record::fields;
  use serde_json::json;

  #[tokio::test]
  async fn test_approval_flow() {
    let (remote, store) = test_store();
    save_access_request(
      &store,
      "U1",
      fields(json!({"email": "tech@h.org", "status": "PENDING"})),
    )
    .await
    .unwrap();
    assert_eq!(pending_access_requests(&store).await.unwrap().data.len(), 1);

    let approved = approve_user(&store, "U1", fields(json!({"email": "tech@h.org", "role": "technician"})))
      .await
      .unwrap()
      .into_inner();
    assert_eq!(approved.id, "U1");

    let request = store.cache().get(Collection::AccessRequests, "U1").unwrap();
    assert_eq!(request.fields[STATUS_FIELD], APPROVED);
    assert!(request.fields.contains_key(APPROVED_AT));
    assert_eq!(request.version, 2);
    assert!(pending_access_requests(&store).await.unwrap().data.is_empty());
    assert_eq!(remote.records(Collection::ApprovedUsers).len(), 1);

    let found = user_by_email(&store, "tech@h.org").await.unwrap().unwrap();
    assert_eq!(found.fields["role"], "technician");
    assert!(user_by_email(&store, "nobody@h.org").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_approve_without_access_request_fails() {
    let (_remote, store) = test_store();
    let err = approve_user(&store, "U9", fields(json!({"email": "x@h.org"})))
      .await
      .unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));
  }
}
