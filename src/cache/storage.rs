//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::fmt;
use std::sync::Arc;

use super::key::RequestKey;
use super::snapshot::ResponseSnapshot;
use crate::db::Database;

/// Lifecycle state of a cache namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceState {
  /// Manifest is being pre-loaded
  Installing,
  /// Fully installed, waiting for cutover
  Waiting,
  /// The generation serving requests
  Active,
  /// Replaced by a newer generation; garbage
  Superseded,
}

impl NamespaceState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Installing => "installing",
      Self::Waiting => "waiting",
      Self::Active => "active",
      Self::Superseded => "superseded",
    }
  }

  pub fn parse(s: &str) -> Result<Self> {
    match s {
      "installing" => Ok(Self::Installing),
      "waiting" => Ok(Self::Waiting),
      "active" => Ok(Self::Active),
      "superseded" => Ok(Self::Superseded),
      other => Err(eyre!("Unknown namespace state '{}'", other)),
    }
  }
}

impl fmt::Display for NamespaceState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Metadata about one namespace.
#[derive(Debug, Clone)]
pub struct NamespaceInfo {
  pub name: String,
  pub generation: String,
  pub state: NamespaceState,
  pub created_at: DateTime<Utc>,
}

/// A single cached response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  /// The cached response
  pub snapshot: ResponseSnapshot,
  /// When the response was stored
  pub stored_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync {
  /// Create an empty namespace, discarding any previous one with the same name.
  fn create_namespace(&self, name: &str, generation: &str, state: NamespaceState) -> Result<()>;

  /// Move a namespace to a new lifecycle state.
  fn set_namespace_state(&self, name: &str, state: NamespaceState) -> Result<()>;

  /// All namespaces, oldest first.
  fn namespaces(&self) -> Result<Vec<NamespaceInfo>>;

  /// Delete a namespace and every entry in it.
  fn delete_namespace(&self, name: &str) -> Result<bool>;

  /// Store a response, re-inserting it at the tail if the key already exists.
  /// An entry that was pinned stays pinned.
  fn put(&self, namespace: &str, key: &RequestKey, snapshot: &ResponseSnapshot) -> Result<()>;

  /// Store a response that eviction must never remove.
  fn put_pinned(&self, namespace: &str, key: &RequestKey, snapshot: &ResponseSnapshot) -> Result<()>;

  /// Get a cached response by key.
  fn get(&self, namespace: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Keys in insertion order, oldest first.
  fn keys(&self, namespace: &str) -> Result<Vec<RequestKey>>;

  /// Keys of unpinned entries in insertion order, oldest first.
  fn evictable_keys(&self, namespace: &str) -> Result<Vec<RequestKey>>;

  /// Delete one entry.
  fn delete(&self, namespace: &str, key: &RequestKey) -> Result<bool>;

  /// Number of entries in a namespace.
  fn count(&self, namespace: &str) -> Result<usize>;
}

/// SQLite-based cache storage implementation.
#[derive(Clone)]
pub struct SqliteStorage {
  db: Arc<Database>,
}

impl SqliteStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  /// INSERT OR REPLACE, keeping the pin of a replaced row unless `pin` is set.
  fn insert(
    &self,
    namespace: &str,
    key: &RequestKey,
    snapshot: &ResponseSnapshot,
    pin: bool,
  ) -> Result<()> {
    let conn = self.db.conn()?;
    let headers = serde_json::to_string(&snapshot.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries
           (namespace, request_key, method, url, status, headers, body, stored_at, pinned)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, MAX(?9, COALESCE(
           (SELECT pinned FROM cache_entries WHERE namespace = ?1 AND request_key = ?2), 0)))",
        params![
          namespace,
          key.cache_hash(),
          key.method(),
          key.url(),
          snapshot.status,
          headers,
          snapshot.body,
          Utc::now().to_rfc3339(),
          pin,
        ],
      )
      .map_err(|e| eyre!("Failed to store {} in {}: {}", key.url(), namespace, e))?;

    Ok(())
  }

  fn select_keys(&self, sql: &str, namespace: &str) -> Result<Vec<RequestKey>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(sql)
      .map_err(|e| eyre!("Failed to prepare key query: {}", e))?;

    let rows: Vec<(String, String)> = stmt
      .query_map(params![namespace], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to query keys: {}", e))?
      .collect::<std::result::Result<_, _>>()
      .map_err(|e| eyre!("Failed to read key row: {}", e))?;

    rows
      .iter()
      .map(|(method, url)| RequestKey::from_parts(method, url))
      .collect()
  }
}

impl CacheStorage for SqliteStorage {
  fn create_namespace(&self, name: &str, generation: &str, state: NamespaceState) -> Result<()> {
    let conn = self.db.conn()?;
    let now = Utc::now().to_rfc3339();

    // Entries go with the old row through ON DELETE CASCADE
    conn
      .execute("DELETE FROM cache_namespaces WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to reset namespace {}: {}", name, e))?;

    conn
      .execute(
        "INSERT INTO cache_namespaces (name, generation, state, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?)",
        params![name, generation, state.as_str(), now, now],
      )
      .map_err(|e| eyre!("Failed to create namespace {}: {}", name, e))?;

    Ok(())
  }

  fn set_namespace_state(&self, name: &str, state: NamespaceState) -> Result<()> {
    let conn = self.db.conn()?;
    let updated = conn
      .execute(
        "UPDATE cache_namespaces SET state = ?, updated_at = ? WHERE name = ?",
        params![state.as_str(), Utc::now().to_rfc3339(), name],
      )
      .map_err(|e| eyre!("Failed to update namespace {}: {}", name, e))?;

    if updated == 0 {
      return Err(eyre!("Namespace {} does not exist", name));
    }
    Ok(())
  }

  fn namespaces(&self) -> Result<Vec<NamespaceInfo>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT name, generation, state, created_at FROM cache_namespaces
         ORDER BY created_at, name",
      )
      .map_err(|e| eyre!("Failed to prepare namespace query: {}", e))?;

    let rows: Vec<(String, String, String, String)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
      .map_err(|e| eyre!("Failed to query namespaces: {}", e))?
      .collect::<std::result::Result<_, _>>()
      .map_err(|e| eyre!("Failed to read namespace row: {}", e))?;

    rows
      .into_iter()
      .map(|(name, generation, state, created_at)| {
        Ok(NamespaceInfo {
          name,
          generation,
          state: NamespaceState::parse(&state)?,
          created_at: parse_datetime(&created_at)?,
        })
      })
      .collect()
  }

  fn delete_namespace(&self, name: &str) -> Result<bool> {
    let conn = self.db.conn()?;
    let deleted = conn
      .execute("DELETE FROM cache_namespaces WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete namespace {}: {}", name, e))?;
    Ok(deleted > 0)
  }

  fn put(&self, namespace: &str, key: &RequestKey, snapshot: &ResponseSnapshot) -> Result<()> {
    self.insert(namespace, key, snapshot, false)
  }

  fn put_pinned(&self, namespace: &str, key: &RequestKey, snapshot: &ResponseSnapshot) -> Result<()> {
    self.insert(namespace, key, snapshot, true)
  }

  fn get(&self, namespace: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self.db.conn()?;
    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, stored_at FROM cache_entries
         WHERE namespace = ? AND request_key = ?",
        params![namespace, key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key.url(), e))?;

    match row {
      Some((status, headers, body, stored_at)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        Ok(Some(CachedResponse {
          snapshot: ResponseSnapshot::new(status, headers, body),
          stored_at: parse_datetime(&stored_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn keys(&self, namespace: &str) -> Result<Vec<RequestKey>> {
    self.select_keys(
      "SELECT method, url FROM cache_entries WHERE namespace = ? ORDER BY seq",
      namespace,
    )
  }

  fn evictable_keys(&self, namespace: &str) -> Result<Vec<RequestKey>> {
    self.select_keys(
      "SELECT method, url FROM cache_entries WHERE namespace = ? AND pinned = 0 ORDER BY seq",
      namespace,
    )
  }

  fn delete(&self, namespace: &str, key: &RequestKey) -> Result<bool> {
    let conn = self.db.conn()?;
    let deleted = conn
      .execute(
        "DELETE FROM cache_entries WHERE namespace = ? AND request_key = ?",
        params![namespace, key.cache_hash()],
      )
      .map_err(|e| eyre!("Failed to delete {}: {}", key.url(), e))?;
    Ok(deleted > 0)
  }

  fn count(&self, namespace: &str) -> Result<usize> {
    let conn = self.db.conn()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE namespace = ?",
        params![namespace],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries in {}: {}", namespace, e))?;
    Ok(count as usize)
  }
}

/// Parse an RFC 3339 timestamp written by this module.
pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn storage() -> SqliteStorage {
    SqliteStorage::new(Arc::new(Database::open_in_memory().unwrap()))
  }

  fn key(path: &str) -> RequestKey {
    RequestKey::get(&Url::parse(&format!("http://pos.local{}", path)).unwrap())
  }

  fn body(text: &str) -> ResponseSnapshot {
    ResponseSnapshot::new(200, vec![], text.as_bytes().to_vec())
  }

  #[test]
  fn test_put_get() {
    let storage = storage();
    storage
      .create_namespace("pos-v1", "v1", NamespaceState::Active)
      .unwrap();
    storage.put("pos-v1", &key("/api/orders"), &body("[]")).unwrap();

    let cached = storage.get("pos-v1", &key("/api/orders")).unwrap().unwrap();
    assert_eq!(cached.snapshot.body, b"[]");
    assert!(storage.get("pos-v1", &key("/api/tables")).unwrap().is_none());
  }

  #[test]
  fn test_keys_are_in_insertion_order_and_overwrite_moves_to_tail() {
    let storage = storage();
    storage
      .create_namespace("pos-v1", "v1", NamespaceState::Active)
      .unwrap();
    for path in ["/a", "/b", "/c"] {
      storage.put("pos-v1", &key(path), &body(path)).unwrap();
    }
    storage.put("pos-v1", &key("/a"), &body("again")).unwrap();

    let keys = storage.keys("pos-v1").unwrap();
    assert_eq!(keys, vec![key("/b"), key("/c"), key("/a")]);
    assert_eq!(storage.count("pos-v1").unwrap(), 3);
    assert_eq!(
      storage.get("pos-v1", &key("/a")).unwrap().unwrap().snapshot.body,
      b"again"
    );
  }

  #[test]
  fn test_namespaces_are_isolated() {
    let storage = storage();
    storage
      .create_namespace("pos-v1", "v1", NamespaceState::Active)
      .unwrap();
    storage
      .create_namespace("pos-v2", "v2", NamespaceState::Waiting)
      .unwrap();
    storage.put("pos-v1", &key("/x"), &body("one")).unwrap();

    assert!(storage.get("pos-v2", &key("/x")).unwrap().is_none());
    assert_eq!(storage.count("pos-v2").unwrap(), 0);
  }

  #[test]
  fn test_delete_namespace_removes_entries() {
    let storage = storage();
    storage
      .create_namespace("pos-v1", "v1", NamespaceState::Active)
      .unwrap();
    storage.put("pos-v1", &key("/x"), &body("one")).unwrap();

    assert!(storage.delete_namespace("pos-v1").unwrap());
    assert_eq!(storage.count("pos-v1").unwrap(), 0);
    assert!(storage.namespaces().unwrap().is_empty());
  }

  #[test]
  fn test_recreating_namespace_starts_empty() {
    let storage = storage();
    storage
      .create_namespace("pos-v1", "v1", NamespaceState::Installing)
      .unwrap();
    storage.put("pos-v1", &key("/x"), &body("one")).unwrap();
    storage
      .create_namespace("pos-v1", "v1", NamespaceState::Installing)
      .unwrap();
    assert_eq!(storage.count("pos-v1").unwrap(), 0);
  }

  #[test]
  fn test_set_state() {
    let storage = storage();
    storage
      .create_namespace("pos-v1", "v1", NamespaceState::Installing)
      .unwrap();
    storage
      .set_namespace_state("pos-v1", NamespaceState::Active)
      .unwrap();

    let namespaces = storage.namespaces().unwrap();
    assert_eq!(namespaces[0].state, NamespaceState::Active);
    assert!(storage
      .set_namespace_state("missing", NamespaceState::Active)
      .is_err());
  }

  #[test]
  fn test_pin_survives_overwrite() {
    let storage = storage();
    storage
      .create_namespace("pos-v1", "v1", NamespaceState::Active)
      .unwrap();
    storage.put_pinned("pos-v1", &key("/index.html"), &body("v1")).unwrap();
    storage.put("pos-v1", &key("/api/orders"), &body("[]")).unwrap();
    storage.put("pos-v1", &key("/index.html"), &body("v2")).unwrap();

    assert_eq!(
      storage.keys("pos-v1").unwrap(),
      vec![key("/api/orders"), key("/index.html")]
    );
    assert_eq!(storage.evictable_keys("pos-v1").unwrap(), vec![key("/api/orders")]);
    assert_eq!(
      storage.get("pos-v1", &key("/index.html")).unwrap().unwrap().snapshot.body,
      b"v2"
    );
  }
}
