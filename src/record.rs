//! Record model shared by the cache, the offline queue and the remote adapter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Free-form record fields, excluding `id`, `version` and `lastUpdated`.
pub type Fields = Map<String, Value>;

/// Server-assigned ordering token.
pub type Timestamp = DateTime<Utc>;

pub const ID_FIELD: &str = "id";
pub const VERSION_FIELD: &str = "version";
pub const LAST_UPDATED_FIELD: &str = "lastUpdated";

/// The fixed set of collections the application stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Collection {
  Requests,
  AccessRequests,
  ApprovedUsers,
  Technicians,
  RejectedUsers,
  SystemConfig,
}

impl Collection {
  pub const ALL: [Collection; 6] = [
    Collection::Requests,
    Collection::AccessRequests,
    Collection::ApprovedUsers,
    Collection::Technicians,
    Collection::RejectedUsers,
    Collection::SystemConfig,
  ];

  /// Name of the collection in the remote store and in the offline queue.
  pub fn as_str(&self) -> &'static str {
    match self {
      Collection::Requests => "requests",
      Collection::AccessRequests => "access-requests",
      Collection::ApprovedUsers => "approved-users",
      Collection::Technicians => "technicians",
      Collection::RejectedUsers => "rejected-users",
      Collection::SystemConfig => "system-config",
    }
  }
}

impl fmt::Display for Collection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Collection {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Collection::ALL
      .iter()
      .find(|c| c.as_str() == s)
      .copied()
      .ok_or_else(|| format!("unknown collection: {}", s))
  }
}

/// One persisted entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
  pub id: String,
  /// Number of confirmed writes; 0 means never confirmed by the remote store
  #[serde(default)]
  pub version: u64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_updated: Option<Timestamp>,
  #[serde(flatten)]
  pub fields: Fields,
}

impl Record {
  pub fn new(id: impl Into<String>, fields: Fields) -> Self {
    Self {
      id: id.into(),
      version: 0,
      last_updated: None,
      fields,
    }
  }

  pub fn with_version(mut self, version: u64) -> Self {
    self.version = version;
    self
  }

  /// Look up a field, including the `id`, `version` and `lastUpdated` pseudo-fields.
  pub fn field(&self, name: &str) -> Option<Value> {
    match name {
      ID_FIELD => Some(Value::String(self.id.clone())),
      VERSION_FIELD => Some(Value::from(self.version)),
      LAST_UPDATED_FIELD => self.last_updated.map(|t| Value::String(t.to_rfc3339())),
      _ => self.fields.get(name).cloned(),
    }
  }

  /// Overwrite fields present in `partial`, keeping the others.
  pub fn merge(&mut self, partial: &Fields) {
    for (key, value) in partial {
      self.fields.insert(key.clone(), value.clone());
    }
  }

  pub fn to_value(&self) -> Value {
    serde_json::to_value(self).unwrap_or(Value::Null)
  }
}

/// Split the reserved keys out of caller-supplied data.
///
/// Returns the remaining fields and the `version` the caller claimed, if any.
pub fn strip_reserved(mut data: Fields) -> (Fields, Option<u64>) {
  data.remove(ID_FIELD);
  data.remove(LAST_UPDATED_FIELD);
  let version = data.remove(VERSION_FIELD).and_then(|v| v.as_u64());
  (data, version)
}

/// Comparison operator of a query filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
  #[serde(rename = "==")]
  Eq,
  #[serde(rename = "!=")]
  NotEq,
  #[serde(rename = "<")]
  Lt,
  #[serde(rename = "<=")]
  Lte,
  #[serde(rename = ">")]
  Gt,
  #[serde(rename = ">=")]
  Gte,
  #[serde(rename = "in")]
  In,
  #[serde(rename = "array-contains")]
  ArrayContains,
}

impl fmt::Display for FilterOp {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      FilterOp::Eq => "==",
      FilterOp::NotEq => "!=",
      FilterOp::Lt => "<",
      FilterOp::Lte => "<=",
      FilterOp::Gt => ">",
      FilterOp::Gte => ">=",
      FilterOp::In => "in",
      FilterOp::ArrayContains => "array-contains",
    };
    f.write_str(s)
  }
}

/// A single `field op value` restriction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
  pub field: String,
  #[serde(rename = "operator")]
  pub op: FilterOp,
  pub value: Value,
}

impl Filter {
  pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
    Self {
      field: field.into(),
      op,
      value: value.into(),
    }
  }

  pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
    Self::new(field, FilterOp::Eq, value)
  }

  /// Evaluate the filter against a record. Missing fields never match.
  pub fn matches(&self, record: &Record) -> bool {
    let Some(actual) = record.field(&self.field) else {
      return false;
    };

    match self.op {
      FilterOp::Eq => actual == self.value,
      FilterOp::NotEq => actual != self.value,
      FilterOp::Lt => compare_values(&actual, &self.value) == Ordering::Less,
      FilterOp::Lte => compare_values(&actual, &self.value) != Ordering::Greater,
      FilterOp::Gt => compare_values(&actual, &self.value) == Ordering::Greater,
      FilterOp::Gte => compare_values(&actual, &self.value) != Ordering::Less,
      FilterOp::In => self
        .value
        .as_array()
        .is_some_and(|candidates| candidates.contains(&actual)),
      FilterOp::ArrayContains => actual
        .as_array()
        .is_some_and(|items| items.contains(&self.value)),
    }
  }
}

impl fmt::Display for Filter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {} {}", self.field, self.op, self.value)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
  Asc,
  Desc,
}

/// Result ordering for list queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
  pub field: String,
  pub direction: Direction,
}

impl Default for OrderBy {
  /// Most recently updated first.
  fn default() -> Self {
    Self {
      field: LAST_UPDATED_FIELD.to_string(),
      direction: Direction::Desc,
    }
  }
}

impl OrderBy {
  pub fn asc(field: impl Into<String>) -> Self {
    Self {
      field: field.into(),
      direction: Direction::Asc,
    }
  }

  pub fn desc(field: impl Into<String>) -> Self {
    Self {
      field: field.into(),
      direction: Direction::Desc,
    }
  }

  pub fn sort(&self, records: &mut [Record]) {
    records.sort_by(|a, b| {
      let lhs = a.field(&self.field).unwrap_or(Value::Null);
      let rhs = b.field(&self.field).unwrap_or(Value::Null);
      // lastUpdated is compared as a timestamp, not as its string rendering
      let ordering = if self.field == LAST_UPDATED_FIELD {
        a.last_updated.cmp(&b.last_updated)
      } else {
        compare_values(&lhs, &rhs)
      };
      match self.direction {
        Direction::Asc => ordering,
        Direction::Desc => ordering.reverse(),
      }
    });
  }
}

/// Compare two JSON values for ordering.
///
/// Numbers compare numerically, strings by codepoint, booleans false < true.
/// Null sorts after everything; other cross-type pairs fall back to a type rank.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
  match (a, b) {
    (Value::Null, Value::Null) => Ordering::Equal,
    (Value::Null, _) => Ordering::Greater,
    (_, Value::Null) => Ordering::Less,
    (Value::Number(na), Value::Number(nb)) => {
      let fa = na.as_f64().unwrap_or(f64::NAN);
      let fb = nb.as_f64().unwrap_or(f64::NAN);
      fa.partial_cmp(&fb).unwrap_or(Ordering::Equal)
    }
    (Value::String(sa), Value::String(sb)) => sa.cmp(sb),
    (Value::Bool(ba), Value::Bool(bb)) => ba.cmp(bb),
    _ => type_rank(a).cmp(&type_rank(b)),
  }
}

fn type_rank(v: &Value) -> u8 {
  match v {
    Value::Number(_) => 0,
    Value::String(_) => 1,
    Value::Bool(_) => 2,
    _ => 3,
  }
}

/// How a record changed in a realtime batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
  Added,
  Modified,
  Removed,
}

/// Categorized records of one realtime notification batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
  pub added: Vec<Record>,
  pub modified: Vec<Record>,
  pub removed: Vec<Record>,
}

impl ChangeSet {
  pub fn push(&mut self, kind: ChangeKind, record: Record) {
    match kind {
      ChangeKind::Added => self.added.push(record),
      ChangeKind::Modified => self.modified.push(record),
      ChangeKind::Removed => self.removed.push(record),
    }
  }

  pub fn len(&self) -> usize {
    self.added.len() + self.modified.len() + self.removed.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// Build a [`Fields`] map from a `serde_json::json!` object literal.
///
/// Non-object values yield an empty map.
pub fn fields(value: Value) -> Fields {
  match value {
    Value::Object(map) => map,
    _ => Fields::new(),
  }
}
