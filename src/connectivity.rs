//! Online/offline state driven by host network signals.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::watch;

/// Process-wide connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Connectivity {
  Online,
  Offline,
}

/// Network notification from the host runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkSignal {
  CameOnline,
  WentOffline,
}

/// Effect of applying a [`NetworkSignal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
  Unchanged,
  WentOffline,
  /// OFFLINE -> ONLINE; queued writes should be replayed
  Reconnected,
}

/// Snapshot answered by the status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
  pub is_online: bool,
  pub is_initialized: bool,
  pub is_syncing: bool,
}

/// Tracks connectivity. Starts ONLINE and only changes on explicit signals;
/// failed remote calls never flip it.
#[derive(Debug)]
pub struct ConnectivityMonitor {
  state: watch::Sender<Connectivity>,
  initialized: AtomicBool,
  /// Live sync guards; a skipped overlapping sync must not clear a running one
  syncing: AtomicUsize,
}

impl Default for ConnectivityMonitor {
  fn default() -> Self {
    Self::new()
  }
}

impl ConnectivityMonitor {
  pub fn new() -> Self {
    let (state, _) = watch::channel(Connectivity::Online);
    Self {
      state,
      initialized: AtomicBool::new(false),
      syncing: AtomicUsize::new(0),
    }
  }

  pub fn state(&self) -> Connectivity {
    *self.state.borrow()
  }

  pub fn is_online(&self) -> bool {
    self.state() == Connectivity::Online
  }

  /// Apply a host signal and report the resulting transition.
  pub fn apply(&self, signal: NetworkSignal) -> Transition {
    let next = match signal {
      NetworkSignal::CameOnline => Connectivity::Online,
      NetworkSignal::WentOffline => Connectivity::Offline,
    };
    let previous = self.state.send_replace(next);

    match (previous, next) {
      (Connectivity::Offline, Connectivity::Online) => {
        tracing::info!("connection restored, remote traffic enabled");
        Transition::Reconnected
      }
      (Connectivity::Online, Connectivity::Offline) => {
        tracing::warn!("connection lost, writes will be queued locally");
        Transition::WentOffline
      }
      _ => Transition::Unchanged,
    }
  }

  /// Receiver notified on every state change.
  pub fn watch(&self) -> watch::Receiver<Connectivity> {
    self.state.subscribe()
  }

  pub fn mark_initialized(&self) {
    self.initialized.store(true, Ordering::SeqCst);
  }

  /// Flag a sync as running until the returned guard is dropped.
  pub fn begin_sync(&self) -> SyncGuard<'_> {
    self.syncing.fetch_add(1, Ordering::SeqCst);
    SyncGuard { monitor: self }
  }

  pub fn status(&self) -> ConnectionStatus {
    ConnectionStatus {
      is_online: self.is_online(),
      is_initialized: self.initialized.load(Ordering::SeqCst),
      is_syncing: self.syncing.load(Ordering::SeqCst) > 0,
    }
  }
}

/// Releases its hold on the syncing flag on drop.
pub struct SyncGuard<'a> {
  monitor: &'a ConnectivityMonitor,
}

impl Drop for SyncGuard<'_> {
  fn drop(&mut self) {
    self.monitor.syncing.fetch_sub(1, Ordering::SeqCst);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_starts_online() {
    let monitor = ConnectivityMonitor::new();
    assert_eq!(monitor.state(), Connectivity::Online);
    assert_eq!(
      monitor.status(),
      ConnectionStatus {
        is_online: true,
        is_initialized: false,
        is_syncing: false
      }
    );
  }

  #[test]
  fn test_transitions() {
    let monitor = ConnectivityMonitor::new();
    assert_eq!(monitor.apply(NetworkSignal::CameOnline), Transition::Unchanged);
    assert_eq!(monitor.apply(NetworkSignal::WentOffline), Transition::WentOffline);
    assert!(!monitor.is_online());
    assert_eq!(monitor.apply(NetworkSignal::WentOffline), Transition::Unchanged);
    assert_eq!(monitor.apply(NetworkSignal::CameOnline), Transition::Reconnected);
    assert!(monitor.is_online());
  }

  #[test]
  fn test_sync_guard_resets_flag() {
    let monitor = ConnectivityMonitor::new();
    {
      let _guard = monitor.begin_sync();
      assert!(monitor.status().is_syncing);
    }
    assert!(!monitor.status().is_syncing);
  }

  #[test]
  fn test_overlapping_sync_guards() {
    let monitor = ConnectivityMonitor::new();
    let outer = monitor.begin_sync();
    {
      let _skipped = monitor.begin_sync();
    }
    // the inner guard ending does not hide the outer sync
    assert!(monitor.status().is_syncing);
    drop(outer);
    assert!(!monitor.status().is_syncing);
  }

  #[tokio::test]
  async fn test_watch_receives_changes() {
    let monitor = ConnectivityMonitor::new();
    let mut rx = monitor.watch();
    monitor.apply(NetworkSignal::WentOffline);
    rx.changed().await.unwrap();
    assert_eq!(*rx.borrow(), Connectivity::Offline);
  }

  #[test]
  fn test_status_serializes_camel_case() {
    let monitor = ConnectivityMonitor::new();
    monitor.mark_initialized();
    let value = serde_json::to_value(monitor.status()).unwrap();
    assert_eq!(value["isOnline"], true);
    assert_eq!(value["isInitialized"], true);
    assert_eq!(value["isSyncing"], false);
  }
}
