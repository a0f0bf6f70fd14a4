use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::queue::SqliteQueue;

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Config {
  #[serde(default)]
  pub store: StoreConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
  /// Location of the durable offline queue (defaults to the user data dir)
  pub queue_path: Option<PathBuf>,
  /// Keep the offline queue in SQLite; `false` keeps it in memory only
  pub durable_queue: bool,
  /// Upper bound on a single remote call
  pub remote_timeout_ms: u64,
  /// Failed drains after which a queued write is discarded and reported
  pub max_drain_attempts: u32,
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      queue_path: None,
      durable_queue: true,
      remote_timeout_ms: 10_000,
      max_drain_attempts: 3,
    }
  }
}

impl StoreConfig {
  pub fn remote_timeout(&self) -> Duration {
    Duration::from_millis(self.remote_timeout_ms)
  }

  /// Resolved queue path: `MRSYNC_QUEUE_PATH`, then the configured path, then the default.
  pub fn queue_path(&self) -> Result<PathBuf> {
    if let Ok(path) = std::env::var("MRSYNC_QUEUE_PATH") {
      return Ok(PathBuf::from(path));
    }
    match &self.queue_path {
      Some(path) => Ok(path.clone()),
      None => SqliteQueue::default_path(),
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
  /// Default filter directive; `RUST_LOG` takes precedence
  pub level: String,
  /// Write daily-rotated log files here instead of stderr
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
    }
  }
}

impl LoggingConfig {
  /// Log directory: `MRSYNC_LOG_DIR` if set, else the configured one.
  pub fn directory(&self) -> Option<PathBuf> {
    std::env::var("MRSYNC_LOG_DIR")
      .ok()
      .map(PathBuf::from)
      .or_else(|| self.directory.clone())
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./mrsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/mrsync/config.yaml
  ///
  /// Every setting has a default, so no file at all is not an error.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("mrsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("mrsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    // an empty document deserializes to null
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    let config: Config = serde_yaml::from_str(contents)?;
    if config.store.max_drain_attempts == 0 {
      return Err(eyre!("store.max_drain_attempts must be at least 1"));
    }
    Ok(config)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = Config::default();
    assert!(config.store.durable_queue);
    assert_eq!(config.store.remote_timeout(), Duration::from_secs(10));
    assert_eq!(config.store.max_drain_attempts, 3);
    assert_eq!(config.logging.level, "info");
  }

  #[test]
  fn test_parse_partial_file() {
    let config = Config::parse(
      "store:\n  remote_timeout_ms: 2500\n  durable_queue: false\nlogging:\n  level: debug\n",
    )
    .unwrap();
    assert_eq!(config.store.remote_timeout_ms, 2500);
    assert!(!config.store.durable_queue);
    assert_eq!(config.store.max_drain_attempts, 3);
    assert_eq!(config.logging.level, "debug");
    assert!(config.logging.directory.is_none());
  }

  #[test]
  fn test_parse_empty_file() {
    assert_eq!(Config::parse("").unwrap(), Config::default());
  }

  #[test]
  fn test_zero_attempts_rejected() {
    assert!(Config::parse("store:\n  max_drain_attempts: 0\n").is_err());
  }

  #[test]
  fn test_load_explicit_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mrsync.yaml");
    std::fs::write(&path, "store:\n  queue_path: /tmp/q.db\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.store.queue_path, Some(PathBuf::from("/tmp/q.db")));

    let missing = dir.path().join("nope.yaml");
    assert!(Config::load(Some(&missing)).is_err());
  }
}
