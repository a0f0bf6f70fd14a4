//! In-memory remote store with realtime fan-out and failure injection.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{ChangeStream, RemoteChange, RemoteEvent, RemoteStore};
use crate::error::{RemoteError, RemoteResult};
use crate::record::{ChangeKind, Collection, Fields, Filter, OrderBy, Record, Timestamp};

/// Remote operation kinds, as recorded in the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
  Get,
  List,
  Put,
  Create,
  Update,
  Delete,
  Subscribe,
}

impl RemoteOp {
  fn is_write(&self) -> bool {
    matches!(
      self,
      RemoteOp::Put | RemoteOp::Create | RemoteOp::Update | RemoteOp::Delete
    )
  }
}

/// One call received by [`MemoryRemote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
  pub op: RemoteOp,
  pub collection: Collection,
  pub id: Option<String>,
}

struct FailureRule {
  op: Option<RemoteOp>,
  id: Option<String>,
  error: RemoteError,
}

impl FailureRule {
  fn matches(&self, call: &RemoteCall) -> bool {
    self.op.map_or(true, |op| op == call.op)
      && self
        .id
        .as_deref()
        .map_or(true, |id| call.id.as_deref() == Some(id))
  }
}

struct Subscriber {
  collection: Collection,
  filters: Vec<Filter>,
  tx: mpsc::UnboundedSender<RemoteEvent>,
}

impl Subscriber {
  fn matches(&self, record: &Record) -> bool {
    self.filters.iter().all(|f| f.matches(record))
  }

  /// Classify a write the way a query listener sees it: entering, staying in or leaving the result set.
  fn classify(&self, before: Option<&Record>, after: Option<&Record>) -> Option<RemoteChange> {
    let was = before.is_some_and(|r| self.matches(r));
    let is = after.is_some_and(|r| self.matches(r));
    match (was, is, before, after) {
      (false, true, _, Some(after)) => Some(RemoteChange::new(ChangeKind::Added, after.clone())),
      (true, true, _, Some(after)) => Some(RemoteChange::new(ChangeKind::Modified, after.clone())),
      (true, false, Some(before), _) => {
        Some(RemoteChange::new(ChangeKind::Removed, before.clone()))
      }
      _ => None,
    }
  }
}

#[derive(Default)]
struct State {
  collections: HashMap<Collection, BTreeMap<String, Record>>,
  subscribers: Vec<Subscriber>,
  calls: Vec<RemoteCall>,
  failures: Vec<FailureRule>,
  unavailable: bool,
  latency: Option<Duration>,
  clock: Option<Timestamp>,
}

impl State {
  /// Next strictly increasing server timestamp.
  fn tick(&mut self) -> Timestamp {
    let now = Utc::now();
    let next = match self.clock {
      Some(last) if now <= last => last + ChronoDuration::microseconds(1),
      _ => now,
    };
    self.clock = Some(next);
    next
  }

  fn check(&mut self, call: RemoteCall) -> RemoteResult<()> {
    let failure = if self.unavailable {
      Some(RemoteError::Unavailable("remote store unreachable".into()))
    } else {
      self
        .failures
        .iter()
        .find(|rule| rule.matches(&call))
        .map(|rule| rule.error.clone())
    };
    self.calls.push(call);
    failure.map_or(Ok(()), Err)
  }

  fn records(&mut self, collection: Collection) -> &mut BTreeMap<String, Record> {
    self.collections.entry(collection).or_default()
  }

  /// Push the effect of a write to every matching listener of the collection.
  fn notify(&mut self, collection: Collection, before: Option<&Record>, after: Option<&Record>) {
    self.subscribers.retain(|sub| {
      if sub.collection != collection {
        return !sub.tx.is_closed();
      }
      match sub.classify(before, after) {
        Some(change) => sub.tx.send(RemoteEvent::Batch(vec![change])).is_ok(),
        None => !sub.tx.is_closed(),
      }
    });
  }

  fn store(&mut self, collection: Collection, mut record: Record) -> Record {
    record.last_updated = Some(self.tick());
    let before = self.records(collection).insert(record.id.clone(), record.clone());
    self.notify(collection, before.as_ref(), Some(&record));
    record
  }
}

/// A [`RemoteStore`] kept entirely in memory.
///
/// Behaves like a document database with query listeners: new listeners first
/// receive every matching record as `added`, then one batch per write. Failures
/// and latency can be injected, and every call is logged.
#[derive(Default)]
pub struct MemoryRemote {
  state: Mutex<State>,
}

impl MemoryRemote {
  pub fn new() -> Self {
    Self::default()
  }

  fn state(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Make every call fail with [`RemoteError::Unavailable`] (or succeed again).
  pub fn set_unavailable(&self, unavailable: bool) {
    self.state().unavailable = unavailable;
  }

  /// Delay every call by `latency` before it is processed.
  pub fn set_latency(&self, latency: Option<Duration>) {
    self.state().latency = latency;
  }

  /// Fail calls matching `op` and `id` (either may be a wildcard) until cleared.
  pub fn fail_on(&self, op: Option<RemoteOp>, id: Option<&str>, error: RemoteError) {
    self.state().failures.push(FailureRule {
      op,
      id: id.map(String::from),
      error,
    });
  }

  pub fn clear_failures(&self) {
    self.state().failures.clear();
  }

  /// Every call received so far, in order.
  pub fn calls(&self) -> Vec<RemoteCall> {
    self.state().calls.clone()
  }

  /// Ids targeted by write calls, in order.
  pub fn written_ids(&self) -> Vec<String> {
    self
      .state()
      .calls
      .iter()
      .filter(|c| c.op.is_write())
      .filter_map(|c| c.id.clone())
      .collect()
  }

  pub fn clear_calls(&self) {
    self.state().calls.clear();
  }

  /// Current remote contents of a collection, ordered by id.
  pub fn records(&self, collection: Collection) -> Vec<Record> {
    self
      .state()
      .collections
      .get(&collection)
      .map(|records| records.values().cloned().collect())
      .unwrap_or_default()
  }

  /// Live listeners on a collection.
  pub fn subscriber_count(&self, collection: Collection) -> usize {
    self
      .state()
      .subscribers
      .iter()
      .filter(|s| s.collection == collection && !s.tx.is_closed())
      .count()
  }

  /// Write a record as another client would, bypassing the call log.
  pub fn seed(&self, collection: Collection, record: Record) -> Record {
    self.state().store(collection, record)
  }

  /// Delete a record as another client would, bypassing the call log.
  pub fn remove_external(&self, collection: Collection, id: &str) -> Option<Record> {
    let mut state = self.state();
    let removed = state.records(collection).remove(id);
    state.notify(collection, removed.as_ref(), None);
    removed
  }

  /// Deliver a raw batch to the listeners of a collection, without touching stored data.
  pub fn emit(&self, collection: Collection, batch: Vec<RemoteChange>) {
    self.state().subscribers.retain(|sub| {
      if sub.collection != collection {
        return !sub.tx.is_closed();
      }
      sub.tx.send(RemoteEvent::Batch(batch.clone())).is_ok()
    });
  }

  /// Break the transport of every listener on a collection.
  pub fn fail_listeners(&self, collection: Collection, error: RemoteError) {
    self.state().subscribers.retain(|sub| {
      if sub.collection == collection {
        let _ = sub.tx.send(RemoteEvent::Error(error.clone()));
        return false;
      }
      !sub.tx.is_closed()
    });
  }

  async fn begin(&self, op: RemoteOp, collection: Collection, id: Option<&str>) -> RemoteResult<()> {
    let latency = self.state().latency;
    if let Some(latency) = latency {
      tokio::time::sleep(latency).await;
    }
    self.state().check(RemoteCall {
      op,
      collection,
      id: id.map(String::from),
    })
  }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
  async fn get(&self, collection: Collection, id: &str) -> RemoteResult<Option<Record>> {
    self.begin(RemoteOp::Get, collection, Some(id)).await?;
    Ok(self.state().records(collection).get(id).cloned())
  }

  async fn list(
    &self,
    collection: Collection,
    filters: &[Filter],
    order: &OrderBy,
  ) -> RemoteResult<Vec<Record>> {
    self.begin(RemoteOp::List, collection, None).await?;
    let mut records: Vec<Record> = self
      .state()
      .records(collection)
      .values()
      .filter(|r| filters.iter().all(|f| f.matches(r)))
      .cloned()
      .collect();
    order.sort(&mut records);
    Ok(records)
  }

  async fn put(&self, collection: Collection, record: Record) -> RemoteResult<Record> {
    self
      .begin(RemoteOp::Put, collection, Some(&record.id))
      .await?;
    Ok(self.state().store(collection, record))
  }

  async fn create(&self, collection: Collection, mut record: Record) -> RemoteResult<Record> {
    self.begin(RemoteOp::Create, collection, None).await?;
    record.id = Uuid::new_v4().simple().to_string()[..20].to_string();
    Ok(self.state().store(collection, record))
  }

  async fn update(
    &self,
    collection: Collection,
    id: &str,
    version: u64,
    partial: Fields,
  ) -> RemoteResult<Record> {
    self.begin(RemoteOp::Update, collection, Some(id)).await?;
    let mut state = self.state();
    let mut record = state
      .records(collection)
      .get(id)
      .cloned()
      .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
    record.merge(&partial);
    record.version = version;
    Ok(state.store(collection, record))
  }

  async fn delete(&self, collection: Collection, id: &str) -> RemoteResult<()> {
    self.begin(RemoteOp::Delete, collection, Some(id)).await?;
    let mut state = self.state();
    let removed = state.records(collection).remove(id);
    state.notify(collection, removed.as_ref(), None);
    Ok(())
  }

  async fn subscribe(
    &self,
    collection: Collection,
    filters: &[Filter],
  ) -> RemoteResult<ChangeStream> {
    self.begin(RemoteOp::Subscribe, collection, None).await?;
    let (tx, rx) = mpsc::unbounded_channel();
    let subscriber = Subscriber {
      collection,
      filters: filters.to_vec(),
      tx,
    };

    let mut state = self.state();
    let initial: Vec<RemoteChange> = state
      .records(collection)
      .values()
      .filter(|r| subscriber.matches(r))
      .map(|r| RemoteChange::new(ChangeKind::Added, r.clone()))
      .collect();
    if !initial.is_empty() {
      let _ = subscriber.tx.send(RemoteEvent::Batch(initial));
    }
    state.subscribers.push(subscriber);
    Ok(rx)
  }
}
