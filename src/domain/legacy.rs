//! One-shot import of data kept by the browser-only version of the app.
//!
//! The legacy dump holds four keys: a list of requests keyed by their request
//! number, technicians grouped by area, access requests and approved users.
//! Entries go through the regular domain operations, so an import made while
//! OFFLINE is queued like any other write.

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

use super::requests::save_request;
use super::technicians::{save_technician, AREA};
use super::users::{approve_user, save_access_request};
use crate::error::{StoreError, StoreResult};
use crate::record::Fields;
use crate::store::RecordStore;

/// Field carrying a request's number in the legacy dump.
pub const REQUEST_NUMBER: &str = "number";
/// Field carrying the id of technicians, access requests and users.
pub const LEGACY_ID: &str = "id";

/// Deserialized legacy dump. Missing keys import nothing.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LegacySnapshot {
  pub requests: Vec<Fields>,
  /// Technicians keyed by area
  pub technicians: BTreeMap<String, Vec<Fields>>,
  pub access_requests: Vec<Fields>,
  pub approved_users: Vec<Fields>,
}

impl LegacySnapshot {
  pub fn from_json(json: &str) -> StoreResult<Self> {
    serde_json::from_str(json)
      .map_err(|e| StoreError::Validation(format!("invalid legacy snapshot: {}", e)))
  }

  pub fn is_empty(&self) -> bool {
    self.requests.is_empty()
      && self.technicians.values().all(Vec::is_empty)
      && self.access_requests.is_empty()
      && self.approved_users.is_empty()
  }
}

/// What [`import_legacy`] wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
  pub requests: usize,
  pub technicians: usize,
  pub access_requests: usize,
  pub approved_users: usize,
  /// Approved users saved without a matching access request to mark
  pub unmatched_approvals: Vec<String>,
  /// Entries without a usable id, as `<section>[<index>]`
  pub skipped: Vec<String>,
}

/// String form of an id field; numbers are accepted too.
fn entry_id(entry: &Fields, field: &str) -> Option<String> {
  match entry.get(field)? {
    Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

/// Import `snapshot` in dependency order: requests, technicians, access
/// requests, then approvals.
///
/// Stops at the first failed write. An approved user whose access request does
/// not exist is still saved and listed in `unmatched_approvals`.
pub async fn import_legacy(store: &RecordStore, snapshot: LegacySnapshot) -> StoreResult<ImportReport> {
  let mut report = ImportReport::default();

  for (index, request) in snapshot.requests.into_iter().enumerate() {
    let Some(number) = entry_id(&request, REQUEST_NUMBER) else {
      report.skipped.push(format!("requests[{}]", index));
      continue;
    };
    save_request(store, &number, request).await?;
    report.requests += 1;
  }

  for (area, technicians) in snapshot.technicians {
    for (index, mut technician) in technicians.into_iter().enumerate() {
      let Some(id) = entry_id(&technician, LEGACY_ID) else {
        report.skipped.push(format!("technicians.{}[{}]", area, index));
        continue;
      };
      technician.insert(AREA.into(), Value::String(area.clone()));
      save_technician(store, &id, technician).await?;
      report.technicians += 1;
    }
  }

  for (index, request) in snapshot.access_requests.into_iter().enumerate() {
    let Some(id) = entry_id(&request, LEGACY_ID) else {
      report.skipped.push(format!("accessRequests[{}]", index));
      continue;
    };
    save_access_request(store, &id, request).await?;
    report.access_requests += 1;
  }

  for (index, user) in snapshot.approved_users.into_iter().enumerate() {
    let Some(id) = entry_id(&user, LEGACY_ID) else {
      report.skipped.push(format!("approvedUsers[{}]", index));
      continue;
    };
    match approve_user(store, &id, user).await {
      Ok(_) => {}
      Err(StoreError::NotFound { .. }) => {
        tracing::warn!(%id, "approved user has no access request to mark");
        report.unmatched_approvals.push(id);
      }
      Err(error) => return Err(error),
    }
    report.approved_users += 1;
  }

  if !report.skipped.is_empty() {
    tracing::warn!(skipped = ?report.skipped, "legacy entries without an id were not imported");
  }
  tracing::info!(
    requests = report.requests,
    technicians = report.technicians,
    access_requests = report.access_requests,
    approved_users = report.approved_users,
    "legacy data imported"
  );
  Ok(report)
}
