//! Realtime subscriptions, one per collection.
//!
//! Each subscription owns a task that pumps remote batches: every batch is
//! classified into a [`ChangeSet`], applied to the mirror cache in transport
//! order, then handed to the observer before the next batch is read.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};

use crate::cache::MirrorCache;
use crate::error::{RemoteError, StoreError, StoreResult};
use crate::event::{EventBus, StoreEvent};
use crate::record::{ChangeKind, ChangeSet, Collection, Filter};
use crate::remote::{ChangeStream, RemoteChange, RemoteEvent, RemoteStore};

/// Consumer of realtime changes for one collection.
pub trait ChangeObserver: Send + Sync {
  /// Called once per remote batch, after the cache was updated.
  fn on_change(&self, collection: Collection, changes: &ChangeSet);

  /// Called when the transport fails. No further changes follow.
  fn on_error(&self, collection: Collection, error: &StoreError);
}

/// [`ChangeObserver`] built from two closures.
pub struct FnObserver<C, E> {
  on_change: C,
  on_error: E,
}

impl<C, E> ChangeObserver for FnObserver<C, E>
where
  C: Fn(Collection, &ChangeSet) + Send + Sync,
  E: Fn(Collection, &StoreError) + Send + Sync,
{
  fn on_change(&self, collection: Collection, changes: &ChangeSet) {
    (self.on_change)(collection, changes)
  }

  fn on_error(&self, collection: Collection, error: &StoreError) {
    (self.on_error)(collection, error)
  }
}

pub fn observer<C, E>(on_change: C, on_error: E) -> Arc<dyn ChangeObserver>
where
  C: Fn(Collection, &ChangeSet) + Send + Sync + 'static,
  E: Fn(Collection, &StoreError) + Send + Sync + 'static,
{
  Arc::new(FnObserver {
    on_change,
    on_error,
  })
}

/// Cancellation handle returned by [`SubscriptionManager::subscribe`].
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
  collection: Collection,
  abort: AbortHandle,
}

impl SubscriptionHandle {
  pub fn collection(&self) -> Collection {
    self.collection
  }

  /// Stop receiving changes. Safe to call more than once.
  pub fn cancel(&self) {
    self.abort.abort();
  }

  pub fn is_active(&self) -> bool {
    !self.abort.is_finished()
  }
}

struct ActiveSubscription {
  id: u64,
  filters: Vec<Filter>,
  task: JoinHandle<()>,
}

type Registry = Arc<Mutex<HashMap<Collection, ActiveSubscription>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<Collection, ActiveSubscription>> {
  registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keeps at most one realtime subscription per collection.
pub struct SubscriptionManager {
  remote: Arc<dyn RemoteStore>,
  cache: Arc<MirrorCache>,
  events: EventBus,
  active: Registry,
  next_id: AtomicU64,
  timeout: Duration,
}

impl SubscriptionManager {
  pub fn new(
    remote: Arc<dyn RemoteStore>,
    cache: Arc<MirrorCache>,
    events: EventBus,
    timeout: Duration,
  ) -> Self {
    Self {
      remote,
      cache,
      events,
      active: Arc::new(Mutex::new(HashMap::new())),
      next_id: AtomicU64::new(1),
      timeout,
    }
  }

  /// Start listening to `collection`, restricted by `filters`.
  ///
  /// Replaces any subscription already active on the collection.
  pub async fn subscribe(
    &self,
    collection: Collection,
    filters: Vec<Filter>,
    observer: Arc<dyn ChangeObserver>,
  ) -> StoreResult<SubscriptionHandle> {
    let stream = tokio::time::timeout(self.timeout, self.remote.subscribe(collection, &filters))
      .await
      .unwrap_or_else(|_| Err(RemoteError::Timeout(self.timeout.as_millis() as u64)))
      .map_err(|e| e.into_store(collection))?;

    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
    let task = tokio::spawn(pump(
      Pump {
        id,
        collection,
        cache: self.cache.clone(),
        events: self.events.clone(),
        registry: self.active.clone(),
        observer,
      },
      stream,
    ));
    let handle = SubscriptionHandle {
      collection,
      abort: task.abort_handle(),
    };

    let previous = lock(&self.active).insert(
      collection,
      ActiveSubscription {
        id,
        filters: filters.clone(),
        task,
      },
    );
    if let Some(previous) = previous {
      previous.task.abort();
      tracing::info!(%collection, "replaced realtime subscription");
    }

    tracing::info!(
      %collection,
      filters = ?filters.iter().map(ToString::to_string).collect::<Vec<_>>(),
      "realtime subscription started"
    );
    Ok(handle)
  }

  /// Cancel the subscription on `collection`. Returns whether one was active.
  pub fn unsubscribe(&self, collection: Collection) -> bool {
    match lock(&self.active).remove(&collection) {
      Some(subscription) => {
        subscription.task.abort();
        tracing::info!(%collection, "realtime subscription stopped");
        true
      }
      None => false,
    }
  }

  pub fn unsubscribe_all(&self) {
    for (collection, subscription) in lock(&self.active).drain() {
      subscription.task.abort();
      tracing::info!(%collection, "realtime subscription stopped");
    }
  }

  pub fn is_active(&self, collection: Collection) -> bool {
    lock(&self.active)
      .get(&collection)
      .is_some_and(|s| !s.task.is_finished())
  }

  /// Filters of the live subscription on `collection`.
  pub fn filters(&self, collection: Collection) -> Option<Vec<Filter>> {
    lock(&self.active)
      .get(&collection)
      .filter(|s| !s.task.is_finished())
      .map(|s| s.filters.clone())
  }

  pub fn active_collections(&self) -> Vec<Collection> {
    let mut collections: Vec<Collection> = lock(&self.active)
      .iter()
      .filter(|(_, s)| !s.task.is_finished())
      .map(|(c, _)| *c)
      .collect();
    collections.sort();
    collections
  }
}

impl Drop for SubscriptionManager {
  fn drop(&mut self) {
    for (_, subscription) in lock(&self.active).drain() {
      subscription.task.abort();
    }
  }
}

struct Pump {
  id: u64,
  collection: Collection,
  cache: Arc<MirrorCache>,
  events: EventBus,
  registry: Registry,
  observer: Arc<dyn ChangeObserver>,
}

impl Pump {
  /// Drop this subscription from the registry unless it was already replaced.
  fn retire(&self) {
    let mut active = lock(&self.registry);
    if active.get(&self.collection).is_some_and(|s| s.id == self.id) {
      active.remove(&self.collection);
    }
  }
}

async fn pump(ctx: Pump, mut stream: ChangeStream) {
  let collection = ctx.collection;

  while let Some(event) = stream.recv().await {
    match event {
      RemoteEvent::Batch(batch) => {
        let changes = apply_batch(&ctx.cache, collection, batch);
        tracing::debug!(
          %collection,
          added = changes.added.len(),
          modified = changes.modified.len(),
          removed = changes.removed.len(),
          "realtime changes"
        );
        ctx.observer.on_change(collection, &changes);
        ctx.events.publish(StoreEvent::Changed {
          collection,
          changes,
        });
      }
      RemoteEvent::Error(error) => {
        let error = error.into_store(collection);
        tracing::error!(%collection, %error, "realtime subscription failed");
        ctx.retire();
        ctx.observer.on_error(collection, &error);
        ctx
          .events
          .publish(StoreEvent::SubscriptionFailed { collection, error });
        return;
      }
    }
  }

  tracing::debug!(%collection, "realtime stream closed by remote");
  ctx.retire();
}

/// Classify a batch and mirror it into the cache, in transport order.
fn apply_batch(cache: &MirrorCache, collection: Collection, batch: Vec<RemoteChange>) -> ChangeSet {
  let mut changes = ChangeSet::default();
  for change in batch {
    match change.kind {
      ChangeKind::Added | ChangeKind::Modified => {
        cache.put(collection, change.record.clone());
      }
      ChangeKind::Removed => {
        cache.remove(collection, &change.record.id);
      }
    }
    changes.push(change.kind, change.record);
  }
  changes
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::record::{fields, Record};
  use crate::remote::MemoryRemote;
  use serde_json::json;
  use tokio::sync::mpsc;

  fn request(id: &str, version: u64, area: &str) -> Record {
    Record::new(id, fields(json!({"area": area}))).with_version(version)
  }

  struct Harness {
    remote: Arc<MemoryRemote>,
    cache: Arc<MirrorCache>,
    manager: SubscriptionManager,
  }

  fn harness() -> Harness {
    let remote = Arc::new(MemoryRemote::new());
    let cache = Arc::new(MirrorCache::new());
    let manager = SubscriptionManager::new(
      remote.clone(),
      cache.clone(),
      EventBus::default(),
      Duration::from_secs(1),
    );
    Harness {
      remote,
      cache,
      manager,
    }
  }

  enum Seen {
    Changes(ChangeSet),
    Error(StoreError),
  }

  fn channel_observer() -> (Arc<dyn ChangeObserver>, mpsc::UnboundedReceiver<Seen>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let err_tx = tx.clone();
    let obs = observer(
      move |_, changes| {
        let _ = tx.send(Seen::Changes(changes.clone()));
      },
      move |_, error| {
        let _ = err_tx.send(Seen::Error(error.clone()));
      },
    );
    (obs, rx)
  }

  async fn next_changes(rx: &mut mpsc::UnboundedReceiver<Seen>) -> ChangeSet {
    match rx.recv().await {
      Some(Seen::Changes(changes)) => changes,
      Some(Seen::Error(e)) => panic!("unexpected error: {}", e),
      None => panic!("observer channel closed"),
    }
  }

  #[tokio::test]
  async fn test_batch_is_classified_and_cached() {
    let h = harness();
    h.cache.put(Collection::Requests, request("R2", 1, "ICU"));
    h.cache.put(Collection::Requests, request("R3", 1, "ICU"));

    let (obs, mut rx) = channel_observer();
    h.manager
      .subscribe(Collection::Requests, vec![], obs)
      .await
      .unwrap();

    h.remote.emit(
      Collection::Requests,
      vec![
        RemoteChange::new(ChangeKind::Removed, request("R3", 1, "ICU")),
        RemoteChange::new(ChangeKind::Added, request("R1", 1, "ER")),
        RemoteChange::new(ChangeKind::Modified, request("R2", 2, "ER")),
      ],
    );

    let changes = next_changes(&mut rx).await;
    assert_eq!(changes.len(), 3);
    assert_eq!(changes.added[0].id, "R1");
    assert_eq!(changes.modified[0].id, "R2");
    assert_eq!(changes.removed[0].id, "R3");

    assert_eq!(h.cache.get(Collection::Requests, "R1").unwrap().fields["area"], "ER");
    assert_eq!(h.cache.get(Collection::Requests, "R2").unwrap().version, 2);
    assert!(h.cache.get(Collection::Requests, "R3").is_none());
  }

  #[tokio::test]
  async fn test_batches_keep_transport_order() {
    let h = harness();
    let (obs, mut rx) = channel_observer();
    h.manager
      .subscribe(Collection::Technicians, vec![], obs)
      .await
      .unwrap();

    h.remote.emit(
      Collection::Technicians,
      vec![
        RemoteChange::new(ChangeKind::Added, request("T2", 1, "ICU")),
        RemoteChange::new(ChangeKind::Added, request("T1", 1, "ICU")),
        // added then removed in one batch: reported twice, absent from cache
        RemoteChange::new(ChangeKind::Removed, request("T2", 1, "ICU")),
      ],
    );

    let changes = next_changes(&mut rx).await;
    let added: Vec<&str> = changes.added.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(added, vec!["T2", "T1"]);
    assert_eq!(changes.removed[0].id, "T2");
    assert!(h.cache.get(Collection::Technicians, "T2").is_none());
    assert!(h.cache.get(Collection::Technicians, "T1").is_some());
  }

  #[tokio::test]
  async fn test_second_subscription_replaces_first() {
    let h = harness();
    let (first, mut first_rx) = channel_observer();
    let (second, mut second_rx) = channel_observer();

    let first_handle = h
      .manager
      .subscribe(Collection::Requests, vec![Filter::eq("area", "ICU")], first)
      .await
      .unwrap();
    h.manager
      .subscribe(Collection::Requests, vec![Filter::eq("area", "ER")], second)
      .await
      .unwrap();

    while first_handle.is_active() {
      tokio::task::yield_now().await;
    }
    assert_eq!(
      h.manager.filters(Collection::Requests),
      Some(vec![Filter::eq("area", "ER")])
    );

    h.remote.seed(Collection::Requests, request("R1", 1, "ER"));
    let changes = next_changes(&mut second_rx).await;
    assert_eq!(changes.added[0].id, "R1");
    // the replaced observer hears nothing more
    assert!(first_rx.try_recv().is_err());
    assert_eq!(h.remote.subscriber_count(Collection::Requests), 1);
  }

  #[tokio::test]
  async fn test_unsubscribe_is_idempotent() {
    let h = harness();
    assert!(!h.manager.unsubscribe(Collection::Requests));

    let (obs, _rx) = channel_observer();
    h.manager
      .subscribe(Collection::Requests, vec![], obs)
      .await
      .unwrap();
    assert!(h.manager.is_active(Collection::Requests));

    assert!(h.manager.unsubscribe(Collection::Requests));
    assert!(!h.manager.unsubscribe(Collection::Requests));
    assert!(!h.manager.is_active(Collection::Requests));
  }

  #[tokio::test]
  async fn test_transport_error_kills_subscription() {
    let h = harness();
    let (obs, mut rx) = channel_observer();
    let handle = h
      .manager
      .subscribe(Collection::AccessRequests, vec![], obs)
      .await
      .unwrap();

    h.remote.fail_listeners(
      Collection::AccessRequests,
      RemoteError::Unavailable("stream reset".into()),
    );

    match rx.recv().await {
      Some(Seen::Error(error)) => assert!(error.is_unavailable()),
      _ => panic!("expected an error callback"),
    }

    // not resurrected
    while handle.is_active() {
      tokio::task::yield_now().await;
    }
    assert!(!h.manager.is_active(Collection::AccessRequests));
    assert!(h.manager.active_collections().is_empty());
  }

  #[tokio::test]
  async fn test_subscribe_failure_is_reported() {
    let h = harness();
    h.remote.set_unavailable(true);
    let (obs, _rx) = channel_observer();
    let err = h
      .manager
      .subscribe(Collection::Requests, vec![], obs)
      .await
      .unwrap_err();
    assert!(err.is_unavailable());
    assert!(!h.manager.is_active(Collection::Requests));
  }

  #[tokio::test]
  async fn test_handle_cancel_stops_delivery() {
    let h = harness();
    let (obs, mut rx) = channel_observer();
    let handle = h
      .manager
      .subscribe(Collection::Technicians, vec![], obs)
      .await
      .unwrap();

    handle.cancel();
    tokio::task::yield_now().await;
    h.remote.seed(Collection::Technicians, request("T1", 1, "ICU"));
    tokio::task::yield_now().await;

    assert!(rx.try_recv().is_err());
    assert!(h.cache.get(Collection::Technicians, "T1").is_none());
  }
}
