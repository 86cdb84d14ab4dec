//! SQLite-backed outbox.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Row};
use std::sync::Arc;
use tracing::{debug, warn};

use super::item::{DeadLetter, NewOperation, OutboxItem};
use crate::cache::parse_datetime;
use crate::db::Database;

/// Durable, ordered queue of pending mutations.
///
/// Items are only ever read in enqueue order and leave the queue through
/// [`OutboxStore::remove`] after a confirmed success, or through
/// [`OutboxStore::dead_letter`] when a configured cap is exceeded.
#[derive(Clone)]
pub struct OutboxStore {
  db: Arc<Database>,
}

const ITEM_COLUMNS: &str = "id, method, url, body, headers, created_at, attempts, last_error";

impl OutboxStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  /// Append an operation. Durable once this returns.
  pub fn enqueue(&self, operation: &NewOperation) -> Result<i64> {
    let conn = self.db.conn()?;
    let body = serde_json::to_string(&operation.body)
      .map_err(|e| eyre!("Failed to serialize body: {}", e))?;
    let headers = serde_json::to_string(&operation.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT INTO outbox (method, url, body, headers, created_at) VALUES (?, ?, ?, ?, ?)",
        params![
          operation.method,
          operation.url,
          body,
          headers,
          Utc::now().to_rfc3339()
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue {} {}: {}", operation.method, operation.url, e))?;

    let id = conn.last_insert_rowid();
    debug!(id, method = %operation.method, url = %operation.url, "Queued operation");
    Ok(id)
  }

  /// All items, in enqueue order.
  pub fn list(&self) -> Result<Vec<OutboxItem>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(&format!("SELECT {} FROM outbox ORDER BY id", ITEM_COLUMNS))
      .map_err(|e| eyre!("Failed to prepare outbox query: {}", e))?;

    let rows: Vec<RawItem> = stmt
      .query_map([], RawItem::from_row)
      .map_err(|e| eyre!("Failed to query outbox: {}", e))?
      .collect::<std::result::Result<_, _>>()
      .map_err(|e| eyre!("Failed to read outbox row: {}", e))?;

    rows.into_iter().map(RawItem::into_item).collect()
  }

  pub fn len(&self) -> Result<usize> {
    let conn = self.db.conn()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count outbox: {}", e))?;
    Ok(count as usize)
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  /// Remove confirmed items.
  pub fn remove(&self, ids: &[i64]) -> Result<usize> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let mut removed = 0;
    for id in ids {
      removed += tx
        .execute("DELETE FROM outbox WHERE id = ?", params![id])
        .map_err(|e| eyre!("Failed to remove outbox item {}: {}", id, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(removed)
  }

  /// Count one more explicit rejection against each item.
  pub fn record_rejections(&self, rejections: &[(i64, Option<String>)]) -> Result<()> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for (id, error) in rejections {
      tx.execute(
        "UPDATE outbox SET attempts = attempts + 1, last_error = ? WHERE id = ?",
        params![error, id],
      )
      .map_err(|e| eyre!("Failed to record rejection of item {}: {}", id, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  /// Move one item to the dead-letter table.
  pub fn dead_letter(&self, id: i64, reason: &str) -> Result<bool> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let copied = tx
      .execute(
        &format!(
          "INSERT INTO outbox_dead ({cols}, reason, dead_at)
           SELECT {cols}, ?, ? FROM outbox WHERE id = ?",
          cols = ITEM_COLUMNS
        ),
        params![reason, Utc::now().to_rfc3339(), id],
      )
      .map_err(|e| eyre!("Failed to dead-letter item {}: {}", id, e))?;
    tx.execute("DELETE FROM outbox WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove dead-lettered item {}: {}", id, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    if copied > 0 {
      warn!(id, reason, "Moved outbox item to dead letters");
    }
    Ok(copied > 0)
  }

  /// Dead-letter every item over the attempt cap or older than the age cap.
  ///
  /// Returns the ids that were moved.
  pub fn expire(
    &self,
    max_attempts: Option<u32>,
    max_age: Option<Duration>,
    now: DateTime<Utc>,
  ) -> Result<Vec<i64>> {
    if max_attempts.is_none() && max_age.is_none() {
      return Ok(Vec::new());
    }

    let mut moved = Vec::new();
    for item in self.list()? {
      let reason = match (max_attempts, max_age) {
        (Some(max), _) if item.attempts >= max => {
          format!("rejected {} times", item.attempts)
        }
        (_, Some(age)) if now - item.created_at > age => {
          format!("older than {} seconds", age.num_seconds())
        }
        _ => continue,
      };
      if self.dead_letter(item.id, &reason)? {
        moved.push(item.id);
      }
    }
    Ok(moved)
  }

  /// Dead-lettered items, oldest first.
  pub fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(&format!(
        "SELECT {}, reason, dead_at FROM outbox_dead ORDER BY id",
        ITEM_COLUMNS
      ))
      .map_err(|e| eyre!("Failed to prepare dead-letter query: {}", e))?;

    let rows: Vec<(RawItem, String, String)> = stmt
      .query_map([], |row| {
        Ok((RawItem::from_row(row)?, row.get(8)?, row.get(9)?))
      })
      .map_err(|e| eyre!("Failed to query dead letters: {}", e))?
      .collect::<std::result::Result<_, _>>()
      .map_err(|e| eyre!("Failed to read dead-letter row: {}", e))?;

    rows
      .into_iter()
      .map(|(raw, reason, dead_at)| {
        Ok(DeadLetter {
          item: raw.into_item()?,
          reason,
          dead_at: parse_datetime(&dead_at)?,
        })
      })
      .collect()
  }
}

/// Row as stored, before JSON and timestamp decoding.
struct RawItem {
  id: i64,
  method: String,
  url: String,
  body: String,
  headers: String,
  created_at: String,
  attempts: u32,
  last_error: Option<String>,
}

impl RawItem {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      method: row.get(1)?,
      url: row.get(2)?,
      body: row.get(3)?,
      headers: row.get(4)?,
      created_at: row.get(5)?,
      attempts: row.get(6)?,
      last_error: row.get(7)?,
    })
  }

  fn into_item(self) -> Result<OutboxItem> {
    Ok(OutboxItem {
      id: self.id,
      method: self.method,
      url: self.url,
      body: serde_json::from_str(&self.body)
        .map_err(|e| eyre!("Corrupt body in outbox item {}: {}", self.id, e))?,
      headers: serde_json::from_str(&self.headers)
        .map_err(|e| eyre!("Corrupt headers in outbox item {}: {}", self.id, e))?,
      created_at: parse_datetime(&self.created_at)?,
      attempts: self.attempts,
      last_error: self.last_error,
    })
  }
}
