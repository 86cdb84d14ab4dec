/// Schema for all persisted local state.
///
/// The outbox tables are independent of the cache tables; nothing joins them.
pub const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- One row per cache namespace (one namespace per deployed generation)
CREATE TABLE IF NOT EXISTS cache_namespaces (
    name TEXT PRIMARY KEY,
    generation TEXT NOT NULL,
    state TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Request -> response snapshots. `seq` gives strict insertion order;
-- INSERT OR REPLACE re-inserts an overwritten entry at the tail.
-- `pinned` entries (the install manifest) are never evicted.
CREATE TABLE IF NOT EXISTS cache_entries (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    namespace TEXT NOT NULL,
    request_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    pinned INTEGER NOT NULL DEFAULT 0,
    UNIQUE (namespace, request_key),
    FOREIGN KEY (namespace) REFERENCES cache_namespaces(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_namespace ON cache_entries(namespace, seq);

-- Pending mutations, replayed in id order
CREATE TABLE IF NOT EXISTS outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    body TEXT NOT NULL,
    headers TEXT NOT NULL,
    created_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);

-- Items removed from the outbox by the attempt / age caps
CREATE TABLE IF NOT EXISTS outbox_dead (
    id INTEGER PRIMARY KEY,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    body TEXT NOT NULL,
    headers TEXT NOT NULL,
    created_at TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    last_error TEXT,
    reason TEXT NOT NULL,
    dead_at TEXT NOT NULL
);

-- Last-known data for optimistic queries
CREATE TABLE IF NOT EXISTS query_snapshots (
    key TEXT PRIMARY KEY,
    timestamp TEXT NOT NULL,
    data TEXT NOT NULL
);
"#;
