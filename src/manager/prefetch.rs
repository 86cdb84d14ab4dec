//! On-demand prefetch of arbitrary URLs into the active namespace.

use color_eyre::{eyre::eyre, Result};
use tracing::{debug, info};

use super::messages::ManagerMessage;
use super::CacheManager;
use crate::cache::RequestKey;
use crate::upstream::OutboundRequest;

/// Outcome of one prefetch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefetchSummary {
  pub total: usize,
  /// URLs fetched and stored
  pub done: usize,
  pub failed: usize,
}

impl CacheManager {
  /// Fetch each URL in order and store successful responses.
  ///
  /// Progress is reported on the message bus after every item; a failing
  /// item is reported and skipped. Fails up front only when no namespace is
  /// active to store into.
  pub async fn prefetch(&self, urls: &[String]) -> Result<PrefetchSummary> {
    let namespace = match self.active_namespace()? {
      Some(namespace) => namespace,
      None => {
        let message = "No active cache to prefetch into".to_string();
        self.bus.publish(ManagerMessage::CacheError {
          message: message.clone(),
        });
        return Err(eyre!(message));
      }
    };

    let mut summary = PrefetchSummary {
      total: urls.len(),
      ..Default::default()
    };

    for url in urls {
      let error = match self.prefetch_one(&namespace, url).await {
        Ok(()) => {
          summary.done += 1;
          None
        }
        Err(e) => {
          debug!(url = %url, error = %e, "Prefetch item failed");
          summary.failed += 1;
          Some(e.to_string())
        }
      };
      self.bus.publish(ManagerMessage::CacheProgress {
        total: summary.total,
        done: summary.done,
        url: url.clone(),
        error,
      });
    }

    info!(
      namespace = %namespace,
      total = summary.total,
      done = summary.done,
      failed = summary.failed,
      "Prefetch complete"
    );
    self.bus.publish(ManagerMessage::CacheComplete {
      total: summary.total,
      done: summary.done,
    });
    Ok(summary)
  }

  async fn prefetch_one(&self, namespace: &str, url: &str) -> Result<()> {
    let url = self.upstream.resolve(url)?;
    let mut snapshot = self
      .upstream
      .fetch(&OutboundRequest::get(url.clone()))
      .await?;
    if !snapshot.is_success() {
      return Err(eyre!("HTTP {}", snapshot.status));
    }
    snapshot.retain_relevant_headers();
    self.storage.put(namespace, &RequestKey::get(&url), &snapshot)
  }
}
