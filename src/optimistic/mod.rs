//! Optimistic read cache (stale-while-revalidate).
//!
//! An [`OptimisticQuery`] exposes the last-known data for a key immediately,
//! hydrated from a persisted snapshot, and replaces it only when a
//! revalidation succeeds. A failed revalidation keeps the previous data and
//! reports the error next to it.

mod store;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

pub use store::{QuerySnapshot, SnapshotStore};

/// Where the exposed data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
  /// Nothing loaded yet
  Empty,
  /// Hydrated from the persisted snapshot
  Snapshot,
  /// Fresh from a successful revalidation
  Network,
  /// Set locally ahead of server confirmation
  Local,
}

/// Everything a consumer renders from.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState<T> {
  pub data: Option<T>,
  pub source: DataSource,
  /// True until a revalidation succeeds in this process
  pub is_stale: bool,
  pub is_loading: bool,
  /// Message of the last failed revalidation
  pub error: Option<String>,
  pub last_updated: Option<DateTime<Utc>>,
}

impl<T> QueryState<T> {
  fn empty() -> Self {
    Self {
      data: None,
      source: DataSource::Empty,
      is_stale: true,
      is_loading: false,
      error: None,
      last_updated: None,
    }
  }
}

pub struct OptimisticQuery<T> {
  key: String,
  store: SnapshotStore,
  state: watch::Sender<QueryState<T>>,
  deps: Mutex<Option<u64>>,
}

impl<T> OptimisticQuery<T>
where
  T: Serialize + DeserializeOwned + Clone + Send + Sync,
{
  /// Create the query, hydrating from the persisted snapshot without
  /// touching the network. An unreadable snapshot counts as none.
  pub fn new(store: SnapshotStore, key: impl Into<String>) -> Self {
    let key = key.into();
    let mut state = QueryState::empty();

    match store.load::<T>(&key) {
      Ok(Some(snapshot)) => {
        debug!(key = %key, timestamp = %snapshot.timestamp, "Hydrated query from snapshot");
        state.data = Some(snapshot.data);
        state.source = DataSource::Snapshot;
        state.last_updated = Some(snapshot.timestamp);
      }
      Ok(None) => {}
      Err(e) => warn!(key = %key, error = %e, "Ignoring unreadable snapshot"),
    }

    let (state, _rx) = watch::channel(state);
    Self {
      key,
      store,
      state,
      deps: Mutex::new(None),
    }
  }

  pub fn key(&self) -> &str {
    &self.key
  }

  pub fn state(&self) -> QueryState<T> {
    self.state.borrow().clone()
  }

  pub fn data(&self) -> Option<T> {
    self.state.borrow().data.clone()
  }

  /// Receiver that sees every state change.
  pub fn subscribe(&self) -> watch::Receiver<QueryState<T>> {
    self.state.subscribe()
  }

  /// Revalidate through `fetcher`.
  ///
  /// Success replaces the data, persists a snapshot and clears the stale
  /// and error flags. Failure leaves the data untouched and records the
  /// error. A `silent` refresh does not raise the loading flag.
  pub async fn refresh<F, Fut>(&self, fetcher: F, silent: bool) -> Result<()>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    if !silent {
      self.state.send_modify(|s| s.is_loading = true);
    }

    match fetcher().await {
      Ok(data) => {
        let timestamp = match self.store.save(&self.key, &data) {
          Ok(timestamp) => timestamp,
          Err(e) => {
            warn!(key = %self.key, error = %e, "Failed to persist snapshot");
            Utc::now()
          }
        };
        self.state.send_modify(|s| {
          s.data = Some(data);
          s.source = DataSource::Network;
          s.is_stale = false;
          s.is_loading = false;
          s.error = None;
          s.last_updated = Some(timestamp);
        });
        Ok(())
      }
      Err(e) => {
        debug!(key = %self.key, error = %e, "Revalidation failed; keeping previous data");
        let message = e.to_string();
        self.state.send_modify(|s| {
          s.is_loading = false;
          s.error = Some(message);
        });
        Err(e)
      }
    }
  }

  /// Refresh when `deps` differs from the last call (always on the first).
  ///
  /// Returns whether a refresh ran.
  pub async fn refresh_if_changed<D, F, Fut>(&self, deps: &D, fetcher: F) -> Result<bool>
  where
    D: Hash + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let mut hasher = DefaultHasher::new();
    deps.hash(&mut hasher);
    let hash = hasher.finish();

    {
      let mut last = self.deps.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
      if *last == Some(hash) {
        return Ok(false);
      }
      *last = Some(hash);
    }

    self.refresh(fetcher, false).await?;
    Ok(true)
  }

  /// Replace the data locally ahead of server confirmation.
  ///
  /// Nothing is persisted and the stale flag is left as is; the next
  /// successful refresh overwrites the value.
  pub fn set_data(&self, data: T) {
    self.state.send_modify(|s| {
      s.data = Some(data);
      s.source = DataSource::Local;
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::Database;
  use serde::Deserialize;
  use std::sync::Arc;

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Order {
    id: u32,
    table: u32,
  }

  fn store() -> SnapshotStore {
    SnapshotStore::new(Arc::new(Database::open_in_memory().unwrap()))
  }

  fn orders(ids: &[u32]) -> Vec<Order> {
    ids.iter().map(|&id| Order { id, table: 1 }).collect()
  }

  #[tokio::test]
  async fn test_starts_empty_and_stale() {
    let query: OptimisticQuery<Vec<Order>> = OptimisticQuery::new(store(), "orders");
    let state = query.state();
    assert!(state.data.is_none());
    assert!(state.is_stale);
    assert_eq!(state.source, DataSource::Empty);
  }

  #[tokio::test]
  async fn test_hydrates_from_snapshot_and_stays_stale() {
    let store = store();
    store.save("orders", &orders(&[1, 2])).unwrap();

    let query: OptimisticQuery<Vec<Order>> = OptimisticQuery::new(store, "orders");
    let state = query.state();
    assert_eq!(state.data, Some(orders(&[1, 2])));
    assert_eq!(state.source, DataSource::Snapshot);
    assert!(state.is_stale);
    assert!(state.last_updated.is_some());
  }

  #[tokio::test]
  async fn test_successful_refresh_persists_snapshot() {
    let store = store();
    let query = OptimisticQuery::new(store.clone(), "orders");

    query
      .refresh(|| async { Ok(orders(&[7])) }, false)
      .await
      .unwrap();

    let state = query.state();
    assert_eq!(state.data, Some(orders(&[7])));
    assert!(!state.is_stale);
    assert!(!state.is_loading);
    assert_eq!(state.source, DataSource::Network);

    let reopened: OptimisticQuery<Vec<Order>> = OptimisticQuery::new(store, "orders");
    assert_eq!(reopened.data(), Some(orders(&[7])));
  }

  #[tokio::test]
  async fn test_failed_refresh_keeps_previous_data() {
    let query = OptimisticQuery::new(store(), "orders");
    query
      .refresh(|| async { Ok(orders(&[1])) }, false)
      .await
      .unwrap();

    let result = query
      .refresh(|| async { Err(eyre!("network down")) }, false)
      .await;
    assert!(result.is_err());

    let state = query.state();
    assert_eq!(state.data, Some(orders(&[1])));
    assert_eq!(state.error.as_deref(), Some("network down"));
    assert!(!state.is_loading);

    query
      .refresh(|| async { Ok(orders(&[1, 2])) }, true)
      .await
      .unwrap();
    assert!(query.state().error.is_none());
  }

  #[tokio::test]
  async fn test_failure_without_data_stays_empty() {
    let query: OptimisticQuery<Vec<Order>> = OptimisticQuery::new(store(), "orders");
    let _ = query
      .refresh(|| async { Err(eyre!("offline")) }, true)
      .await;
    let state = query.state();
    assert!(state.data.is_none());
    assert!(state.is_stale);
    assert!(state.error.is_some());
  }

  #[tokio::test]
  async fn test_refresh_if_changed() {
    let query = OptimisticQuery::new(store(), "orders");

    assert!(query
      .refresh_if_changed(&("open", 1), || async { Ok(orders(&[1])) })
      .await
      .unwrap());
    assert!(!query
      .refresh_if_changed(&("open", 1), || async { Ok(orders(&[2])) })
      .await
      .unwrap());
    assert_eq!(query.data(), Some(orders(&[1])));

    assert!(query
      .refresh_if_changed(&("open", 2), || async { Ok(orders(&[3])) })
      .await
      .unwrap());
    assert_eq!(query.data(), Some(orders(&[3])));
  }

  #[tokio::test]
  async fn test_set_data_is_local_only() {
    let store = store();
    let query = OptimisticQuery::new(store.clone(), "orders");
    query
      .refresh(|| async { Ok(orders(&[1])) }, false)
      .await
      .unwrap();

    query.set_data(orders(&[1, 99]));
    assert_eq!(query.data(), Some(orders(&[1, 99])));
    assert_eq!(query.state().source, DataSource::Local);

    let persisted = store.load::<Vec<Order>>("orders").unwrap().unwrap();
    assert_eq!(persisted.data, orders(&[1]));
  }

  #[tokio::test]
  async fn test_subscribers_see_updates() {
    let query = OptimisticQuery::new(store(), "orders");
    let mut rx = query.subscribe();

    query
      .refresh(|| async { Ok(orders(&[5])) }, true)
      .await
      .unwrap();

    assert!(rx.has_changed().unwrap());
    assert_eq!(rx.borrow_and_update().data, Some(orders(&[5])));
  }
}
