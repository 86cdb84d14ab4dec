//! Injected online/offline state.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::upstream::{OutboundRequest, Upstream};

/// Process-wide connectivity state, shared by cloning.
///
/// Anything may report an observation through [`Connectivity::set_online`];
/// subscribers see each offline -> online transition as a change.
#[derive(Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Record an observation. Returns true when the state actually changed.
  pub fn set_online(&self, online: bool) -> bool {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });
    if changed {
      info!(online, "Connectivity changed");
    }
    changed
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }

  /// Poll `probe_path` on the upstream every `interval`.
  ///
  /// Any HTTP response means online; a transport failure means offline.
  pub fn spawn_probe(
    &self,
    upstream: Upstream,
    probe_path: &str,
    interval: Duration,
  ) -> color_eyre::Result<JoinHandle<()>> {
    let url = upstream.resolve(probe_path)?;
    let connectivity = self.clone();

    Ok(tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        let request = OutboundRequest::get(url.clone()).with_timeout(Some(interval));
        let online = match upstream.fetch(&request).await {
          Ok(_) => true,
          Err(e) => {
            debug!(error = %e, "Connectivity probe failed");
            false
          }
        };
        connectivity.set_online(online);
      }
    }))
  }
}
