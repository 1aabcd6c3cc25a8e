//! Cache storage trait and SQLite implementation.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};

use super::traits::{CacheKey, CachedEntry, LifecycleState, NamespaceInfo};
use crate::net::{Headers, Response};

/// Trait for cache storage backends.
///
/// Every entry lives inside a named namespace. Writes to a namespace that
/// was never opened are errors.
pub trait CacheStorage: Send + Sync {
  /// Open a namespace, creating it in `state` if absent.
  /// Returns true when the namespace was created by this call.
  fn open_namespace(&self, name: &str, state: LifecycleState) -> Result<bool>;

  /// Record the lifecycle state of an existing namespace.
  fn set_namespace_state(&self, name: &str, state: LifecycleState) -> Result<()>;

  /// All namespaces with their state and entry count.
  fn list_namespaces(&self) -> Result<Vec<NamespaceInfo>>;

  /// Delete a namespace and every entry in it.
  fn delete_namespace(&self, name: &str) -> Result<bool>;

  /// Look up an entry by key.
  fn get(&self, namespace: &str, key: &CacheKey) -> Result<Option<CachedEntry>>;

  /// Store a response snapshot, overwriting any existing entry.
  ///
  /// An overwrite moves the entry to the back of the insertion order.
  fn put(&self, namespace: &str, key: &CacheKey, response: &Response) -> Result<()>;

  /// Delete an entry. Returns false if it was not present.
  fn delete(&self, namespace: &str, key: &CacheKey) -> Result<bool>;

  /// Keys ordered oldest insertion first.
  fn keys_in_insertion_order(&self, namespace: &str) -> Result<Vec<CacheKey>>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a throwaway in-memory database.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
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

    Ok(data_dir.join("shellcache").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS namespaces (
    name TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per cached request; seq defines FIFO order within a namespace
CREATE TABLE IF NOT EXISTS entries (
    namespace TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    cache_key TEXT NOT NULL,
    seq INTEGER NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (namespace, key_hash),
    FOREIGN KEY (namespace) REFERENCES namespaces(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_entries_seq ON entries(namespace, seq);
"#;

impl CacheStorage for SqliteStorage {
  fn open_namespace(&self, name: &str, state: LifecycleState) -> Result<bool> {
    let conn = self.lock()?;

    let inserted = conn
      .execute(
        "INSERT OR IGNORE INTO namespaces (name, state) VALUES (?, ?)",
        params![name, state.as_str()],
      )
      .map_err(|e| eyre!("Failed to open namespace {}: {}", name, e))?;

    Ok(inserted > 0)
  }

  fn set_namespace_state(&self, name: &str, state: LifecycleState) -> Result<()> {
    let conn = self.lock()?;

    let updated = conn
      .execute(
        "UPDATE namespaces SET state = ? WHERE name = ?",
        params![state.as_str(), name],
      )
      .map_err(|e| eyre!("Failed to update namespace {}: {}", name, e))?;

    if updated == 0 {
      return Err(eyre!("Namespace not found: {}", name));
    }
    Ok(())
  }

  fn list_namespaces(&self) -> Result<Vec<NamespaceInfo>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT n.name, n.state, COUNT(e.key_hash) FROM namespaces n
         LEFT JOIN entries e ON e.namespace = n.name
         GROUP BY n.name
         ORDER BY n.created_at, n.name",
      )
      .map_err(|e| eyre!("Failed to prepare namespace query: {}", e))?;

    let rows: Vec<(String, String, i64)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
      .map_err(|e| eyre!("Failed to list namespaces: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read namespace row: {}", e))?;

    rows
      .into_iter()
      .map(|(name, state, count)| {
        let state =
          LifecycleState::parse(&state).ok_or_else(|| eyre!("Unknown namespace state '{}'", state))?;
        Ok(NamespaceInfo {
          name,
          state,
          entry_count: count as usize,
        })
      })
      .collect()
  }

  fn delete_namespace(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;

    // Entries go with the namespace via ON DELETE CASCADE
    let deleted = conn
      .execute("DELETE FROM namespaces WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete namespace {}: {}", name, e))?;

    Ok(deleted > 0)
  }

  fn get(&self, namespace: &str, key: &CacheKey) -> Result<Option<CachedEntry>> {
    let conn = self.lock()?;

    let row: Option<(i64, u16, String, Vec<u8>)> = conn
      .query_row(
        "SELECT seq, status, headers, body FROM entries
         WHERE namespace = ? AND key_hash = ?",
        params![namespace, key.hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read entry {}: {}", key, e))?;

    match row {
      Some((seq, status, headers, body)) => {
        let headers: Headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", key, e))?;
        Ok(Some(CachedEntry {
          response: Response::new(status, headers, body),
          seq,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, namespace: &str, key: &CacheKey, response: &Response) -> Result<()> {
    let conn = self.lock()?;

    let exists: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM namespaces WHERE name = ?",
        params![namespace],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up namespace {}: {}", namespace, e))?;
    if exists.is_none() {
      return Err(eyre!("Namespace not found: {}", namespace));
    }

    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO entries (namespace, key_hash, cache_key, seq, status, headers, body, stored_at)
         VALUES (?1, ?2, ?3,
                 (SELECT COALESCE(MAX(seq), 0) + 1 FROM entries WHERE namespace = ?1),
                 ?4, ?5, ?6, datetime('now'))",
        params![
          namespace,
          key.hash(),
          key.as_str(),
          response.status,
          headers,
          response.body
        ],
      )
      .map_err(|e| eyre!("Failed to store entry {}: {}", key, e))?;

    Ok(())
  }

  fn delete(&self, namespace: &str, key: &CacheKey) -> Result<bool> {
    let conn = self.lock()?;

    let deleted = conn
      .execute(
        "DELETE FROM entries WHERE namespace = ? AND key_hash = ?",
        params![namespace, key.hash()],
      )
      .map_err(|e| eyre!("Failed to delete entry {}: {}", key, e))?;

    Ok(deleted > 0)
  }

  fn keys_in_insertion_order(&self, namespace: &str) -> Result<Vec<CacheKey>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT cache_key FROM entries WHERE namespace = ? ORDER BY seq")
      .map_err(|e| eyre!("Failed to prepare key query: {}", e))?;

    let keys = stmt
      .query_map(params![namespace], |row| row.get::<_, String>(0))
      .map_err(|e| eyre!("Failed to list keys: {}", e))?
      .map(|r| r.map(CacheKey::from))
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read key row: {}", e))?;

    Ok(keys)
  }
}

/// In-process storage with the same semantics as [`SqliteStorage`].
#[cfg(test)]
#[derive(Default)]
pub struct MemoryStorage {
  namespaces: Mutex<Vec<MemoryNamespace>>,
}

#[cfg(test)]
struct MemoryNamespace {
  name: String,
  state: LifecycleState,
  entries: std::collections::HashMap<CacheKey, CachedEntry>,
  next_seq: i64,
}

#[cfg(test)]
impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn with_namespace<R>(
    &self,
    name: &str,
    f: impl FnOnce(&mut MemoryNamespace) -> R,
  ) -> Result<Option<R>> {
    let mut namespaces = self
      .namespaces
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(namespaces.iter_mut().find(|ns| ns.name == name).map(f))
  }
}

#[cfg(test)]
impl CacheStorage for MemoryStorage {
  fn open_namespace(&self, name: &str, state: LifecycleState) -> Result<bool> {
    let mut namespaces = self
      .namespaces
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if namespaces.iter().any(|ns| ns.name == name) {
      return Ok(false);
    }
    namespaces.push(MemoryNamespace {
      name: name.to_string(),
      state,
      entries: std::collections::HashMap::new(),
      next_seq: 1,
    });
    Ok(true)
  }

  fn set_namespace_state(&self, name: &str, state: LifecycleState) -> Result<()> {
    self
      .with_namespace(name, |ns| ns.state = state)?
      .ok_or_else(|| eyre!("Namespace not found: {}", name))
  }

  fn list_namespaces(&self) -> Result<Vec<NamespaceInfo>> {
    let namespaces = self
      .namespaces
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      namespaces
        .iter()
        .map(|ns| NamespaceInfo {
          name: ns.name.clone(),
          state: ns.state,
          entry_count: ns.entries.len(),
        })
        .collect(),
    )
  }

  fn delete_namespace(&self, name: &str) -> Result<bool> {
    let mut namespaces = self
      .namespaces
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let before = namespaces.len();
    namespaces.retain(|ns| ns.name != name);
    Ok(namespaces.len() != before)
  }

  fn get(&self, namespace: &str, key: &CacheKey) -> Result<Option<CachedEntry>> {
    Ok(
      self
        .with_namespace(namespace, |ns| ns.entries.get(key).cloned())?
        .flatten(),
    )
  }

  fn put(&self, namespace: &str, key: &CacheKey, response: &Response) -> Result<()> {
    self
      .with_namespace(namespace, |ns| {
        let seq = ns.next_seq;
        ns.next_seq += 1;
        ns.entries.insert(
          key.clone(),
          CachedEntry {
            response: response.clone(),
            seq,
          },
        );
      })?
      .ok_or_else(|| eyre!("Namespace not found: {}", namespace))
  }

  fn delete(&self, namespace: &str, key: &CacheKey) -> Result<bool> {
    Ok(
      self
        .with_namespace(namespace, |ns| ns.entries.remove(key).is_some())?
        .unwrap_or(false),
    )
  }

  fn keys_in_insertion_order(&self, namespace: &str) -> Result<Vec<CacheKey>> {
    Ok(
      self
        .with_namespace(namespace, |ns| {
          let mut entries: Vec<(&CacheKey, &CachedEntry)> = ns.entries.iter().collect();
          entries.sort_by_key(|(_, e)| e.seq);
          entries.into_iter().map(|(k, _)| k.clone()).collect()
        })?
        .unwrap_or_default(),
    )
  }
}
