//! Versioned response cache.
//!
//! This module provides the storage side of the caching proxy:
//! - Named namespaces, one per deployed generation, with a lifecycle state
//! - Request -> response snapshots kept in strict insertion order
//! - Best-effort FIFO eviction down to a maximum entry count

mod eviction;
mod key;
mod snapshot;
mod storage;

pub use eviction::{prune, PruneReport};
pub use key::RequestKey;
pub use snapshot::{ResponseOrigin, ResponseSnapshot, CACHE_MARKER_HEADER};
pub use storage::{CacheStorage, CachedResponse, NamespaceInfo, NamespaceState, SqliteStorage};

pub(crate) use storage::parse_datetime;
