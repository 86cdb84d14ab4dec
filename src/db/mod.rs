pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Shared SQLite connection holding every piece of persisted local state
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database file at `path`
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a throwaway in-memory database
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Get the default database path inside `data_dir`, or the platform data directory
  pub fn default_path(data_dir: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = data_dir {
      return Ok(dir.join("state.db"));
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("pos-sync").join("state.db"))
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    let conn = self.conn()?;
    conn
      .execute_batch(schema::SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;

    // Databases created before manifest pinning lack the column
    let has_pinned: bool = conn
      .query_row(
        "SELECT COUNT(*) > 0 FROM pragma_table_info('cache_entries') WHERE name = 'pinned'",
        [],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to inspect cache_entries: {}", e))?;
    if !has_pinned {
      conn
        .execute_batch("ALTER TABLE cache_entries ADD COLUMN pinned INTEGER NOT NULL DEFAULT 0;")
        .map_err(|e| eyre!("Failed to add pinned column: {}", e))?;
    }
    Ok(())
  }

  /// Lock the connection for a unit of work
  pub fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}
