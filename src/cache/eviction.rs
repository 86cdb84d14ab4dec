//! FIFO eviction for cache namespaces.

use color_eyre::Result;
use tracing::{debug, warn};

use super::storage::CacheStorage;

/// Outcome of a pruning pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
  /// Evictable entries present before pruning
  pub before: usize,
  /// Entries actually deleted
  pub removed: usize,
  /// Deletions that failed and were skipped
  pub failed: usize,
}

impl PruneReport {
  pub fn remaining(&self) -> usize {
    self.before - self.removed
  }
}

/// Delete the oldest entries of `namespace` until at most `max_entries` remain.
///
/// Pinned entries are neither counted nor removed. Only enumeration errors are returned. A failed deletion is logged and
/// skipped, so one bad entry never stops the rest of the pass.
pub fn prune(
  storage: &dyn CacheStorage,
  namespace: &str,
  max_entries: usize,
) -> Result<PruneReport> {
  let keys = storage.evictable_keys(namespace)?;
  let mut report = PruneReport {
    before: keys.len(),
    ..Default::default()
  };

  if keys.len() <= max_entries {
    return Ok(report);
  }

  let excess = keys.len() - max_entries;
  for key in keys.iter().take(excess) {
    match storage.delete(namespace, key) {
      Ok(_) => report.removed += 1,
      Err(e) => {
        warn!(namespace, url = key.url(), error = %e, "Failed to evict cache entry");
        report.failed += 1;
      }
    }
  }

  debug!(
    namespace,
    removed = report.removed,
    failed = report.failed,
    "Pruned cache namespace"
  );
  Ok(report)
}
