//! Queue storage trait and its SQLite and in-memory implementations.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{PendingWrite, QueuedWrite};

/// Trait for offline queue storage backends.
///
/// Entries are kept in append order; `front` always returns the oldest one.
pub trait QueueStorage: Send + Sync {
  /// Append a write under the given key.
  fn append(&self, key: &str, write: &PendingWrite) -> Result<()>;

  /// Oldest queued write, if any.
  fn front(&self) -> Result<Option<QueuedWrite>>;

  /// All queued writes in order.
  fn entries(&self) -> Result<Vec<QueuedWrite>>;

  /// Remove an entry. Returns whether it existed.
  fn remove(&self, key: &str) -> Result<bool>;

  /// Bump the failed-attempt counter of an entry and return the new count.
  fn record_failure(&self, key: &str) -> Result<u32>;

  /// Number of queued writes.
  fn len(&self) -> Result<usize>;
}

/// Queue storage that lives only as long as the process.
/// Used when durability is disabled and in tests.
#[derive(Debug, Default)]
pub struct MemoryQueue {
  entries: Mutex<VecDeque<QueuedWrite>>,
}

impl MemoryQueue {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, VecDeque<QueuedWrite>>> {
    self.entries.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl QueueStorage for MemoryQueue {
  fn append(&self, key: &str, write: &PendingWrite) -> Result<()> {
    let mut entries = self.lock()?;
    if entries.iter().any(|e| e.key == key) {
      return Err(eyre!("Duplicate offline entry key: {}", key));
    }
    entries.push_back(QueuedWrite {
      key: key.to_string(),
      write: write.clone(),
      attempts: 0,
    });
    Ok(())
  }

  fn front(&self) -> Result<Option<QueuedWrite>> {
    Ok(self.lock()?.front().cloned())
  }

  fn entries(&self) -> Result<Vec<QueuedWrite>> {
    Ok(self.lock()?.iter().cloned().collect())
  }

  fn remove(&self, key: &str) -> Result<bool> {
    let mut entries = self.lock()?;
    match entries.iter().position(|e| e.key == key) {
      Some(pos) => {
        entries.remove(pos);
        Ok(true)
      }
      None => Ok(false),
    }
  }

  fn record_failure(&self, key: &str) -> Result<u32> {
    let mut entries = self.lock()?;
    let entry = entries
      .iter_mut()
      .find(|e| e.key == key)
      .ok_or_else(|| eyre!("No offline entry with key {}", key))?;
    entry.attempts += 1;
    Ok(entry.attempts)
  }

  fn len(&self) -> Result<usize> {
    Ok(self.lock()?.len())
  }
}

/// SQLite-based durable queue storage.
pub struct SqliteQueue {
  conn: Mutex<Connection>,
}

impl SqliteQueue {
  /// Open or create the queue database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create queue directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open queue database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Non-durable SQLite queue, mostly useful in tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory queue database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("mrsync").join("offline-queue.db"))
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for the queue table.
  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(QUEUE_SCHEMA)
      .map_err(|e| eyre!("Failed to run queue migrations: {}", e))?;
    Ok(())
  }
}

/// Schema for the offline queue.
const QUEUE_SCHEMA: &str = r#"
-- One row per pending write; seq preserves enqueue order across deletes
CREATE TABLE IF NOT EXISTS offline_writes (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    entry_key TEXT NOT NULL UNIQUE,
    collection TEXT NOT NULL,
    record_id TEXT,
    payload BLOB NOT NULL,
    enqueued_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0
);
"#;

const SELECT_ENTRIES: &str =
  "SELECT entry_key, payload, attempts FROM offline_writes ORDER BY seq";

fn decode_row(key: String, payload: Vec<u8>, attempts: u32) -> Result<QueuedWrite> {
  let write: PendingWrite = serde_json::from_slice(&payload)
    .map_err(|e| eyre!("Failed to deserialize offline entry {}: {}", key, e))?;
  Ok(QueuedWrite {
    key,
    write,
    attempts,
  })
}

impl QueueStorage for SqliteQueue {
  fn append(&self, key: &str, write: &PendingWrite) -> Result<()> {
    let payload =
      serde_json::to_vec(write).map_err(|e| eyre!("Failed to serialize offline entry: {}", e))?;

    self
      .lock()?
      .execute(
        "INSERT INTO offline_writes (entry_key, collection, record_id, payload, enqueued_at)
         VALUES (?, ?, ?, ?, ?)",
        params![
          key,
          write.collection.as_str(),
          write.effective_id(),
          payload,
          Utc::now().to_rfc3339()
        ],
      )
      .map_err(|e| eyre!("Failed to store offline entry {}: {}", key, e))?;

    Ok(())
  }

  fn front(&self) -> Result<Option<QueuedWrite>> {
    let conn = self.lock()?;

    let row: Option<(String, Vec<u8>, u32)> = conn
      .query_row(&format!("{} LIMIT 1", SELECT_ENTRIES), [], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
      })
      .optional()
      .map_err(|e| eyre!("Failed to read offline queue head: {}", e))?;

    row
      .map(|(key, payload, attempts)| decode_row(key, payload, attempts))
      .transpose()
  }

  fn entries(&self) -> Result<Vec<QueuedWrite>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(SELECT_ENTRIES)
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, Vec<u8>, u32)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
      .map_err(|e| eyre!("Failed to query offline queue: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read offline entry: {}", e))?;

    rows
      .into_iter()
      .map(|(key, payload, attempts)| decode_row(key, payload, attempts))
      .collect()
  }

  fn remove(&self, key: &str) -> Result<bool> {
    let removed = self
      .lock()?
      .execute(
        "DELETE FROM offline_writes WHERE entry_key = ?",
        params![key],
      )
      .map_err(|e| eyre!("Failed to remove offline entry {}: {}", key, e))?;
    Ok(removed > 0)
  }

  fn record_failure(&self, key: &str) -> Result<u32> {
    let conn = self.lock()?;

    let updated = conn
      .execute(
        "UPDATE offline_writes SET attempts = attempts + 1 WHERE entry_key = ?",
        params![key],
      )
      .map_err(|e| eyre!("Failed to update offline entry {}: {}", key, e))?;
    if updated == 0 {
      return Err(eyre!("No offline entry with key {}", key));
    }

    conn
      .query_row(
        "SELECT attempts FROM offline_writes WHERE entry_key = ?",
        params![key],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to read offline entry {}: {}", key, e))
  }

  fn len(&self) -> Result<usize> {
    let count: i64 = self
      .lock()?
      .query_row("SELECT COUNT(*) FROM offline_writes", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count offline entries: {}", e))?;
    Ok(count as usize)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::record::{fields, Collection};
  use serde_json::json;

  fn write(id: &str) -> PendingWrite {
    PendingWrite::save(
      Collection::Requests,
      Some(id.to_string()),
      fields(json!({"title": format!("request {}", id)})),
    )
  }

  fn exercise(storage: &dyn QueueStorage) {
    storage.append("k1", &write("R1")).unwrap();
    storage.append("k2", &write("R2")).unwrap();
    storage.append("k3", &write("R3")).unwrap();
    assert_eq!(storage.len().unwrap(), 3);

    let front = storage.front().unwrap().unwrap();
    assert_eq!(front.key, "k1");
    assert_eq!(front.write.id.as_deref(), Some("R1"));
    assert_eq!(front.attempts, 0);

    assert_eq!(storage.record_failure("k1").unwrap(), 1);
    assert_eq!(storage.record_failure("k1").unwrap(), 2);
    assert!(storage.record_failure("missing").is_err());

    assert!(storage.remove("k2").unwrap());
    assert!(!storage.remove("k2").unwrap());

    let keys: Vec<String> = storage
      .entries()
      .unwrap()
      .into_iter()
      .map(|e| e.key)
      .collect();
    assert_eq!(keys, vec!["k1", "k3"]);
    assert_eq!(storage.front().unwrap().unwrap().attempts, 2);

    // duplicate keys are refused instead of silently replacing an entry
    assert!(storage.append("k1", &write("R9")).is_err());
  }

  #[test]
  fn test_memory_queue() {
    exercise(&MemoryQueue::new());
  }

  #[test]
  fn test_sqlite_queue() {
    exercise(&SqliteQueue::open_in_memory().unwrap());
  }

  #[test]
  fn test_sqlite_queue_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("queue.db");

    {
      let storage = SqliteQueue::open(&path).unwrap();
      storage.append("k1", &write("R1")).unwrap();
      storage.append("k2", &write("R2")).unwrap();
      storage.remove("k1").unwrap();
      storage.append("k3", &write("R3")).unwrap();
    }

    let storage = SqliteQueue::open(&path).unwrap();
    let entries = storage.entries().unwrap();
    let keys: Vec<&str> = entries.iter().map(|e| e.key.as_str()).collect();
    assert_eq!(keys, vec!["k2", "k3"]);
    assert_eq!(entries[0].write.id.as_deref(), Some("R2"));
    assert_eq!(entries[0].write.data, write("R2").data);
  }
}
