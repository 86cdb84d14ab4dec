//! Messages between the manager and foreground contexts.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const BUS_CAPACITY: usize = 256;

/// Commands a foreground context can send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientCommand {
  /// Activate the waiting generation now
  SkipWaiting,
  /// Fetch and cache each URL in order
  CacheUrls { urls: Vec<String> },
}

/// Notifications broadcast to every subscribed context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManagerMessage {
  /// A new generation is installed and waiting for cutover
  NewVersionAvailable,
  /// One prefetch item finished; `done` counts items cached so far
  CacheProgress {
    total: usize,
    done: usize,
    url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
  },
  /// Prefetch finished
  CacheComplete { total: usize, done: usize },
  /// Prefetch could not run at all
  CacheError { message: String },
}

/// Broadcast channel with at-least-once delivery to current subscribers.
///
/// Subscribers that joined after a message was sent never see it, and a
/// subscriber that falls more than the channel capacity behind skips ahead.
#[derive(Clone)]
pub struct MessageBus {
  tx: broadcast::Sender<ManagerMessage>,
}

impl MessageBus {
  pub fn new() -> Self {
    let (tx, _rx) = broadcast::channel(BUS_CAPACITY);
    Self { tx }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ManagerMessage> {
    self.tx.subscribe()
  }

  /// Send to every current subscriber. Having none is not an error.
  pub fn publish(&self, message: ManagerMessage) {
    let _ = self.tx.send(message);
  }
}

impl Default for MessageBus {
  fn default() -> Self {
    Self::new()
  }
}
