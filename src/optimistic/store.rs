//! Persisted `{timestamp, data}` snapshots for optimistic queries.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

use crate::cache::parse_datetime;
use crate::db::Database;

/// Last-known data for one query key.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnapshot<T> {
  pub timestamp: DateTime<Utc>,
  pub data: T,
}

/// Key/value store for query snapshots. Snapshots are overwritten on every
/// successful revalidation and never deleted automatically.
#[derive(Clone)]
pub struct SnapshotStore {
  db: Arc<Database>,
}

impl SnapshotStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<QuerySnapshot<T>>> {
    let conn = self.db.conn()?;
    let row: Option<(String, String)> = conn
      .query_row(
        "SELECT timestamp, data FROM query_snapshots WHERE key = ?",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to load snapshot {}: {}", key, e))?;

    match row {
      Some((timestamp, data)) => {
        let data = serde_json::from_str(&data)
          .map_err(|e| eyre!("Failed to deserialize snapshot {}: {}", key, e))?;
        Ok(Some(QuerySnapshot {
          timestamp: parse_datetime(&timestamp)?,
          data,
        }))
      }
      None => Ok(None),
    }
  }

  /// Overwrite the snapshot for `key`, stamped now.
  pub fn save<T: Serialize>(&self, key: &str, data: &T) -> Result<DateTime<Utc>> {
    let json =
      serde_json::to_string(data).map_err(|e| eyre!("Failed to serialize snapshot {}: {}", key, e))?;
    let now = Utc::now();

    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO query_snapshots (key, timestamp, data) VALUES (?, ?, ?)",
        params![key, now.to_rfc3339(), json],
      )
      .map_err(|e| eyre!("Failed to save snapshot {}: {}", key, e))?;

    Ok(now)
  }
}
