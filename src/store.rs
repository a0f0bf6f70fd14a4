//! Record access façade.
//!
//! [`RecordStore`] is the public CRUD surface. It composes the remote adapter,
//! the mirror cache, the offline queue, the connectivity monitor and the
//! subscription manager:
//!
//! - reads go to the remote store and fall back to the cache on failure,
//! - saves made while OFFLINE are queued and applied optimistically to the cache,
//! - every other remote failure is returned to the caller.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cache::{MirrorCache, Sourced};
use crate::config::StoreConfig;
use crate::connectivity::{
  ConnectionStatus, Connectivity, ConnectivityMonitor, NetworkSignal, Transition,
};
use crate::error::{RemoteError, RemoteResult, StoreError, StoreResult};
use crate::event::{EventBus, StoreEvent};
use crate::queue::{DrainHalt, DrainReport, MemoryQueue, OfflineQueue, PendingWrite, SqliteQueue};
use crate::record::{
  fields, strip_reserved, Collection, Fields, Filter, OrderBy, Record, VERSION_FIELD,
};
use crate::remote::RemoteStore;
use crate::subscription::{ChangeObserver, SubscriptionHandle, SubscriptionManager};

/// Id of the record probed by [`RecordStore::initialize`].
pub const HEALTH_RECORD_ID: &str = "health";

/// Tunables of a [`RecordStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
  /// Upper bound on a single remote call
  pub remote_timeout: Duration,
  /// Buffered events per lagging listener
  pub event_capacity: usize,
}

impl Default for StoreOptions {
  fn default() -> Self {
    Self {
      remote_timeout: Duration::from_secs(10),
      event_capacity: 256,
    }
  }
}

/// Record counts reported by [`RecordStore::system_stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStats {
  pub total_requests: usize,
  pub total_technicians: usize,
  pub total_users: usize,
  pub last_sync: DateTime<Utc>,
  /// At least one count came from the cache instead of the remote store
  pub degraded: bool,
}

/// Offline-aware record store. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct RecordStore {
  remote: Arc<dyn RemoteStore>,
  cache: Arc<MirrorCache>,
  queue: Arc<OfflineQueue>,
  monitor: Arc<ConnectivityMonitor>,
  subscriptions: Arc<SubscriptionManager>,
  events: EventBus,
  /// Serializes every cache/remote write, including drain steps
  writes: Arc<Mutex<()>>,
  timeout: Duration,
}

impl RecordStore {
  pub fn new(remote: Arc<dyn RemoteStore>, queue: OfflineQueue, options: StoreOptions) -> Self {
    let cache = Arc::new(MirrorCache::new());
    let events = EventBus::new(options.event_capacity);
    let subscriptions = Arc::new(SubscriptionManager::new(
      remote.clone(),
      cache.clone(),
      events.clone(),
      options.remote_timeout,
    ));

    Self {
      remote,
      cache,
      queue: Arc::new(queue),
      monitor: Arc::new(ConnectivityMonitor::new()),
      subscriptions,
      events,
      writes: Arc::new(Mutex::new(())),
      timeout: options.remote_timeout,
    }
  }

  /// Build a store from configuration, opening the offline queue it names.
  pub fn from_config(remote: Arc<dyn RemoteStore>, config: &StoreConfig) -> color_eyre::Result<Self> {
    let queue = if config.durable_queue {
      let path = config.queue_path()?;
      tracing::info!(path = %path.display(), "opening durable offline queue");
      OfflineQueue::new(SqliteQueue::open(&path)?)
    } else {
      OfflineQueue::new(MemoryQueue::new())
    };
    let options = StoreOptions {
      remote_timeout: config.remote_timeout(),
      ..StoreOptions::default()
    };
    Ok(Self::new(
      remote,
      queue.with_max_attempts(config.max_drain_attempts),
      options,
    ))
  }

  pub fn cache(&self) -> &MirrorCache {
    &self.cache
  }

  pub fn queue(&self) -> &OfflineQueue {
    &self.queue
  }

  pub fn connectivity(&self) -> Connectivity {
    self.monitor.state()
  }

  pub fn is_online(&self) -> bool {
    self.monitor.is_online()
  }

  pub fn status(&self) -> ConnectionStatus {
    self.monitor.status()
  }

  pub fn events(&self) -> broadcast::Receiver<StoreEvent> {
    self.events.subscribe()
  }

  /// Run a remote call under the configured timeout.
  async fn call<T>(
    &self,
    collection: Collection,
    fut: impl Future<Output = RemoteResult<T>>,
  ) -> StoreResult<T> {
    match tokio::time::timeout(self.timeout, fut).await {
      Ok(result) => result.map_err(|e| e.into_store(collection)),
      Err(_) => Err(RemoteError::Timeout(self.timeout.as_millis() as u64).into_store(collection)),
    }
  }

  fn offline_error(&self, collection: Collection, operation: &str) -> StoreError {
    tracing::debug!(%collection, operation, "refusing remote call while offline");
    StoreError::RemoteUnavailable(format!("offline, {} on {} not sent", operation, collection))
  }

  /// Version the next confirmed write of `id` should carry.
  ///
  /// Only a confirmed cached copy (version above 0) is trusted. Otherwise the
  /// remote copy is read, so a cold cache never sends a lower version.
  async fn next_version(
    &self,
    collection: Collection,
    id: Option<&str>,
    claimed: Option<u64>,
  ) -> StoreResult<u64> {
    let stored = match id {
      None => 0,
      Some(id) => match self.cache.get(collection, id).filter(|r| r.version > 0) {
        Some(cached) => cached.version,
        None => self
          .call(collection, self.remote.get(collection, id))
          .await?
          .map_or(0, |r| r.version),
      },
    };
    Ok(stored.max(claimed.unwrap_or(0)) + 1)
  }

  /// Upsert at `id`, or create with a remote-assigned id when `id` is `None`.
  ///
  /// While OFFLINE the write is queued without any remote round trip and the
  /// cache is updated optimistically; a create gets a `local-` placeholder id.
  pub async fn save(
    &self,
    collection: Collection,
    id: Option<&str>,
    data: Fields,
  ) -> StoreResult<Sourced<Record>> {
    if id.is_some_and(|id| id.trim().is_empty()) {
      return Err(StoreError::Validation("record id must not be empty".into()));
    }

    let _write = self.writes.lock().await;

    if !self.monitor.is_online() {
      return self.save_offline(collection, id, data);
    }

    let (data, claimed) = strip_reserved(data);
    let version = self.next_version(collection, id, claimed).await?;

    let saved = match id {
      Some(id) => {
        let record = Record::new(id, data).with_version(version);
        self.call(collection, self.remote.put(collection, record)).await?
      }
      None => {
        let record = Record::new(String::new(), data).with_version(version);
        self.call(collection, self.remote.create(collection, record)).await?
      }
    };

    self.cache.put(collection, saved.clone());
    tracing::debug!(%collection, id = %saved.id, version = saved.version, "saved record");
    Ok(Sourced::remote(saved))
  }

  fn save_offline(
    &self,
    collection: Collection,
    id: Option<&str>,
    data: Fields,
  ) -> StoreResult<Sourced<Record>> {
    let (data, claimed) = strip_reserved(data);

    let (mut write, local_id) = match id {
      Some(id) => (
        PendingWrite::save(collection, Some(id.to_string()), data.clone()),
        id.to_string(),
      ),
      None => {
        let local_id = format!("local-{}", Uuid::new_v4().simple());
        (
          PendingWrite::save(collection, None, data.clone()).with_local_id(local_id.clone()),
          local_id,
        )
      }
    };

    // unconfirmed, so the version is carried over but not bumped
    let version = self
      .cache
      .get(collection, &local_id)
      .map_or(0, |r| r.version)
      .max(claimed.unwrap_or(0));
    if let Some(claimed) = claimed {
      write.data.insert(VERSION_FIELD.to_string(), Value::from(claimed));
    }

    let key = self.queue.enqueue(write)?;
    let record = Record::new(local_id.clone(), data).with_version(version);
    self.cache.put(collection, record.clone());

    self.events.publish(StoreEvent::Queued {
      collection,
      id: local_id,
      key,
    });
    Ok(Sourced::queued(record))
  }

  /// Read one record, falling back to the cache when the remote call fails.
  pub async fn fetch(&self, collection: Collection, id: &str) -> StoreResult<Sourced<Record>> {
    if id.trim().is_empty() {
      return Err(StoreError::Validation("record id must not be empty".into()));
    }

    let remote = if self.monitor.is_online() {
      self.call(collection, self.remote.get(collection, id)).await
    } else {
      Err(self.offline_error(collection, "get"))
    };

    match remote {
      Ok(Some(record)) => {
        self.cache.put(collection, record.clone());
        Ok(Sourced::remote(record))
      }
      Ok(None) => {
        self.cache.remove(collection, id);
        Err(StoreError::NotFound {
          collection,
          id: id.to_string(),
        })
      }
      Err(error) => {
        tracing::warn!(%collection, %id, %error, "remote read failed, serving cache");
        self
          .cache
          .get_entry(collection, id)
          .map(|entry| Sourced::fallback(entry.record, Some(entry.cached_at)))
          .ok_or_else(|| StoreError::NotFound {
            collection,
            id: id.to_string(),
          })
      }
    }
  }

  /// Query a collection ordered by `lastUpdated`, newest first.
  pub async fn list(
    &self,
    collection: Collection,
    filters: &[Filter],
  ) -> StoreResult<Sourced<Vec<Record>>> {
    self.list_ordered(collection, filters, &OrderBy::default()).await
  }

  /// Query a collection with an explicit ordering.
  ///
  /// When the remote call fails the whole cached collection is returned
  /// without applying `filters`; callers must tolerate over-fetched results.
  pub async fn list_ordered(
    &self,
    collection: Collection,
    filters: &[Filter],
    order: &OrderBy,
  ) -> StoreResult<Sourced<Vec<Record>>> {
    let remote = if self.monitor.is_online() {
      self
        .call(collection, self.remote.list(collection, filters, order))
        .await
    } else {
      Err(self.offline_error(collection, "list"))
    };

    match remote {
      Ok(records) => {
        for record in &records {
          self.cache.put(collection, record.clone());
        }
        Ok(Sourced::remote(records))
      }
      Err(error) => {
        tracing::warn!(
          %collection,
          %error,
          ignored_filters = filters.len(),
          "remote query failed, serving unfiltered cache"
        );
        let mut records = self.cache.list(collection);
        order.sort(&mut records);
        Ok(Sourced::fallback(
          records,
          self.cache.oldest_cached_at(collection),
        ))
      }
    }
  }

  /// Merge `partial` into an existing record and bump its version.
  ///
  /// Never queued: fails with `RemoteUnavailable` while OFFLINE.
  pub async fn update(&self, collection: Collection, id: &str, partial: Fields) -> StoreResult<Record> {
    if id.trim().is_empty() {
      return Err(StoreError::Validation("update requires a record id".into()));
    }
    if !self.monitor.is_online() {
      return Err(self.offline_error(collection, "update"));
    }

    let _write = self.writes.lock().await;
    let (partial, claimed) = strip_reserved(partial);
    let version = self.next_version(collection, Some(id), claimed).await?;

    let confirmed = match self
      .call(
        collection,
        self.remote.update(collection, id, version, partial),
      )
      .await
    {
      Ok(record) => record,
      Err(error @ StoreError::NotFound { .. }) => {
        self.cache.remove(collection, id);
        return Err(error);
      }
      Err(error) => return Err(error),
    };

    // keep cached fields the remote copy does not carry
    let merged = match self.cache.get(collection, id) {
      Some(mut cached) => {
        cached.merge(&confirmed.fields);
        cached.version = confirmed.version;
        cached.last_updated = confirmed.last_updated;
        cached
      }
      None => confirmed,
    };
    self.cache.put(collection, merged.clone());
    tracing::debug!(%collection, %id, version = merged.version, "updated record");
    Ok(merged)
  }

  /// Delete remotely, then drop the cached copy.
  pub async fn delete(&self, collection: Collection, id: &str) -> StoreResult<()> {
    if id.trim().is_empty() {
      return Err(StoreError::Validation("delete requires a record id".into()));
    }
    if !self.monitor.is_online() {
      return Err(self.offline_error(collection, "delete"));
    }

    let _write = self.writes.lock().await;
    self
      .call(collection, self.remote.delete(collection, id))
      .await?;
    self.cache.remove(collection, id);
    tracing::debug!(%collection, %id, "deleted record");
    Ok(())
  }

  /// Listen to realtime changes; replaces any subscription on the same collection.
  pub async fn subscribe(
    &self,
    collection: Collection,
    filters: Vec<Filter>,
    observer: Arc<dyn ChangeObserver>,
  ) -> StoreResult<SubscriptionHandle> {
    if !self.monitor.is_online() {
      return Err(self.offline_error(collection, "subscribe"));
    }
    self
      .subscriptions
      .subscribe(collection, filters, observer)
      .await
  }

  pub fn unsubscribe(&self, collection: Collection) -> bool {
    self.subscriptions.unsubscribe(collection)
  }

  pub fn unsubscribe_all(&self) {
    self.subscriptions.unsubscribe_all()
  }

  pub fn active_subscriptions(&self) -> Vec<Collection> {
    self.subscriptions.active_collections()
  }

  /// Apply a host network signal.
  ///
  /// A reconnect starts a drain in the background and returns its handle;
  /// the caller is not required to await it.
  pub fn handle_signal(&self, signal: NetworkSignal) -> Option<JoinHandle<Option<DrainReport>>> {
    match self.monitor.apply(signal) {
      Transition::Unchanged => None,
      Transition::WentOffline => {
        self.events.publish(StoreEvent::Connectivity(Connectivity::Offline));
        None
      }
      Transition::Reconnected => {
        self.events.publish(StoreEvent::Connectivity(Connectivity::Online));
        let store = self.clone();
        Some(tokio::spawn(async move { store.drain().await }))
      }
    }
  }

  /// Feed host network signals into the store until the sender is dropped.
  pub fn watch_network(&self, mut signals: mpsc::Receiver<NetworkSignal>) -> JoinHandle<()> {
    let store = self.clone();
    tokio::spawn(async move {
      while let Some(signal) = signals.recv().await {
        store.handle_signal(signal);
      }
      tracing::debug!("network signal source closed");
    })
  }

  /// Replay queued writes now if ONLINE. `None` when offline or already draining.
  pub async fn force_sync(&self) -> Option<DrainReport> {
    if !self.monitor.is_online() {
      tracing::info!("force sync skipped while offline");
      return None;
    }
    self.drain().await
  }

  async fn drain(&self) -> Option<DrainReport> {
    let _syncing = self.monitor.begin_sync();
    let store = self.clone();
    let report = self
      .queue
      .drain(
        move |write| {
          let store = store.clone();
          async move { store.replay(write).await }
        },
        || self.monitor.is_online(),
      )
      .await?;

    if let Some(DrainHalt::Discarded { write, .. }) = &report.halted {
      self.revert_discarded(write).await;
    }

    self.events.publish(StoreEvent::Drained(report.clone()));
    Some(report)
  }

  /// Drop the optimistic copy of a write that will never reach the remote
  /// store, restoring the remote copy when it can still be read.
  async fn revert_discarded(&self, write: &PendingWrite) {
    let _write = self.writes.lock().await;
    let collection = write.collection;
    let Some(local_id) = write.effective_id() else {
      return;
    };
    self.cache.remove(collection, local_id);

    if let Some(id) = &write.id {
      match self.call(collection, self.remote.get(collection, id)).await {
        Ok(Some(record)) => {
          self.cache.put(collection, record);
        }
        Ok(None) => {}
        Err(error) => {
          tracing::warn!(%collection, %id, %error, "could not restore record after discard")
        }
      }
    }
    tracing::warn!(%collection, id = %local_id, "dropped cached copy of discarded write");
  }

  /// Apply one queued write to the remote store and mirror the result.
  async fn replay(&self, write: PendingWrite) -> StoreResult<Record> {
    let _write = self.writes.lock().await;
    let collection = write.collection;
    let (data, claimed) = strip_reserved(write.data.clone());
    // placeholder ids never exist remotely, creates start from the claimed version
    let version = self
      .next_version(collection, write.id.as_deref(), claimed)
      .await?;

    let confirmed = match &write.id {
      Some(id) => {
        let record = Record::new(id.clone(), data).with_version(version);
        self.call(collection, self.remote.put(collection, record)).await?
      }
      None => {
        let record = Record::new(String::new(), data).with_version(version);
        self.call(collection, self.remote.create(collection, record)).await?
      }
    };

    if write.id.is_none() {
      if let Some(local_id) = &write.local_id {
        self.cache.remove(collection, local_id);
      }
    }
    self.cache.put(collection, confirmed.clone());
    Ok(confirmed)
  }

  /// Probe the remote store through the `system-config/health` record,
  /// creating it when missing. Marks the store initialized on success.
  ///
  /// A failed probe is returned but leaves connectivity untouched.
  pub async fn initialize(&self) -> StoreResult<()> {
    let collection = Collection::SystemConfig;
    let probe = self.health_check(collection).await;
    match &probe {
      Ok(()) => {
        self.monitor.mark_initialized();
        tracing::info!("remote store healthy");
      }
      Err(error) => tracing::error!(%error, "health check failed"),
    }
    probe
  }

  async fn health_check(&self, collection: Collection) -> StoreResult<()> {
    if !self.monitor.is_online() {
      return Err(self.offline_error(collection, "health check"));
    }

    let existing = self
      .call(collection, self.remote.get(collection, HEALTH_RECORD_ID))
      .await?;
    let record = match existing {
      Some(record) => record,
      None => {
        let _write = self.writes.lock().await;
        let health = Record::new(
          HEALTH_RECORD_ID,
          fields(json!({
            "status": "active",
            "lastCheck": Utc::now().to_rfc3339(),
          })),
        )
        .with_version(1);
        self.call(collection, self.remote.put(collection, health)).await?
      }
    };
    self.cache.put(collection, record);
    Ok(())
  }

  /// Count requests, technicians and approved users.
  pub async fn system_stats(&self) -> StoreResult<SystemStats> {
    let (requests, technicians, users) = futures::try_join!(
      self.list(Collection::Requests, &[]),
      self.list(Collection::Technicians, &[]),
      self.list(Collection::ApprovedUsers, &[]),
    )?;

    Ok(SystemStats {
      degraded: requests.is_stale() || technicians.is_stale() || users.is_stale(),
      total_requests: requests.data.len(),
      total_technicians: technicians.data.len(),
      total_users: users.data.len(),
      last_sync: Utc::now(),
    })
  }

  /// Drop every cached record. Queued writes are kept.
  pub fn clear_cache(&self) {
    self.cache.clear();
    tracing::info!("mirror cache cleared");
  }
}
