//! Replays the outbox against the batch reconciliation endpoint.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use super::backoff::RetryPolicy;
use super::connectivity::Connectivity;
use super::protocol::{SyncBatchRequest, SyncBatchResponse};
use crate::config::SyncConfig;
use crate::outbox::{OutboxItem, OutboxStore};
use crate::upstream::{OutboundRequest, Upstream};

/// Counters for one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
  /// Batch requests sent
  pub batches: usize,
  /// Operations submitted across all batches
  pub submitted: usize,
  /// Operations confirmed and removed from the outbox
  pub removed: usize,
  /// Operations explicitly rejected and kept
  pub rejected: usize,
  /// Items moved to dead letters by the caps
  pub dead_lettered: usize,
}

/// Result of [`SyncCoordinator::flush`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
  /// Nothing queued
  Empty,
  /// Another flush holds the lock; nothing was sent
  AlreadyRunning,
  /// Every batch got a 2xx response
  Synced(FlushReport),
  /// A batch failed at the transport or HTTP level. Items of that batch and
  /// every later batch are untouched.
  Failed { report: FlushReport, error: String },
}

/// Flushes the outbox. At most one flush runs at a time.
pub struct SyncCoordinator {
  outbox: OutboxStore,
  upstream: Upstream,
  endpoint: Url,
  batch_timeout: Option<Duration>,
  item_max_attempts: Option<u32>,
  item_max_age: Option<chrono::Duration>,
  /// Credential for batches whose items carry none
  fallback_token: Option<String>,
  flush_lock: Mutex<()>,
  trigger: Arc<Notify>,
}

impl SyncCoordinator {
  pub fn new(outbox: OutboxStore, upstream: Upstream, config: &SyncConfig) -> Result<Self> {
    let endpoint = upstream.resolve(&config.endpoint)?;
    let item_max_age = config
      .item_max_age_secs
      .map(|secs| {
        chrono::Duration::try_seconds(secs as i64)
          .ok_or_else(|| eyre!("item_max_age_secs out of range: {}", secs))
      })
      .transpose()?;

    Ok(Self {
      outbox,
      upstream,
      endpoint,
      batch_timeout: config.batch_timeout_secs.map(Duration::from_secs),
      item_max_attempts: config.item_max_attempts,
      item_max_age,
      fallback_token: None,
      flush_lock: Mutex::new(()),
      trigger: Arc::new(Notify::new()),
    })
  }

  pub fn with_fallback_token(mut self, token: Option<String>) -> Self {
    self.fallback_token = token;
    self
  }

  /// Handle that asks [`SyncCoordinator::run`] for a flush.
  pub fn flush_trigger(&self) -> Arc<Notify> {
    Arc::clone(&self.trigger)
  }

  pub fn outbox(&self) -> &OutboxStore {
    &self.outbox
  }

  /// Submit every queued item and reconcile the per-item results.
  ///
  /// Items are split into consecutive runs sharing one `Authorization`
  /// value; each run is one batch request carrying that credential. Runs go
  /// out in order and the first failing run stops the flush.
  pub async fn flush(&self) -> Result<FlushOutcome> {
    let Ok(_guard) = self.flush_lock.try_lock() else {
      debug!("Flush already running");
      return Ok(FlushOutcome::AlreadyRunning);
    };

    let items = self.outbox.list()?;
    if items.is_empty() {
      return Ok(FlushOutcome::Empty);
    }

    info!(count = items.len(), "Flushing outbox");
    let mut report = FlushReport::default();

    for segment in segment_by_credential(&items) {
      report.batches += 1;
      report.submitted += segment.len();

      let response = match self.submit(segment).await {
        Ok(response) => response,
        Err(e) => {
          warn!(error = %e, "Batch sync failed; outbox left as is");
          return Ok(FlushOutcome::Failed {
            report,
            error: e.to_string(),
          });
        }
      };

      let (removed, rejected) = self.reconcile(segment, &response)?;
      report.removed += removed;
      report.rejected += rejected;
    }

    report.dead_lettered += self.apply_caps()?;
    info!(
      removed = report.removed,
      rejected = report.rejected,
      batches = report.batches,
      "Outbox flushed"
    );
    Ok(FlushOutcome::Synced(report))
  }

  /// POST one batch. Any transport error or non-2xx status is a failure.
  async fn submit(&self, items: &[OutboxItem]) -> Result<SyncBatchResponse> {
    let batch = serde_json::to_value(SyncBatchRequest::from_items(items))
      .map_err(|e| eyre!("Failed to serialize batch: {}", e))?;

    let mut request = OutboundRequest::new("POST", self.endpoint.clone())
      .with_json(&batch)
      .with_timeout(self.batch_timeout);
    let token = items
      .first()
      .and_then(OutboxItem::authorization)
      .or(self.fallback_token.as_deref());
    if let Some(token) = token {
      request = request.with_header("authorization", token);
    }

    let response = self
      .upstream
      .fetch(&request)
      .await
      .map_err(|e| eyre!("Batch request failed: {}", e))?;

    if !response.is_success() {
      return Err(eyre!("Batch endpoint returned HTTP {}", response.status));
    }

    serde_json::from_slice(&response.body)
      .map_err(|e| eyre!("Failed to parse batch response: {}", e))
  }

  /// Remove confirmed items, count rejections on the rest.
  fn reconcile(&self, items: &[OutboxItem], response: &SyncBatchResponse) -> Result<(usize, usize)> {
    let mut confirmed = Vec::new();
    let mut rejected = Vec::new();

    for (index, item) in items.iter().enumerate() {
      if response.is_rejected(index) {
        let error = response.error(index);
        warn!(id = item.id, url = %item.url, error = ?error, "Server rejected queued operation");
        rejected.push((item.id, error));
      } else {
        confirmed.push(item.id);
      }
    }

    let removed = self.outbox.remove(&confirmed)?;
    self.outbox.record_rejections(&rejected)?;
    Ok((removed, rejected.len()))
  }

  /// Only runs after every batch got a 2xx; a failed flush touches nothing.
  fn apply_caps(&self) -> Result<usize> {
    let moved = self
      .outbox
      .expire(self.item_max_attempts, self.item_max_age, Utc::now())?;
    Ok(moved.len())
  }

  /// Flush on every offline -> online transition, and retry failed flushes
  /// with backoff while connectivity holds.
  ///
  /// An initial flush runs if the watcher already reports online. A
  /// [`flush_trigger`](SyncCoordinator::flush_trigger) notification flushes
  /// right away unless a retry is already scheduled.
  pub async fn run(self: Arc<Self>, connectivity: Connectivity, retry: RetryPolicy) {
    let mut rx = connectivity.subscribe();
    let mut was_online = *rx.borrow_and_update();
    let mut retries = 0u32;
    let mut retry_at: Option<Instant> = None;

    if was_online {
      retry_at = self.flush_and_schedule(&retry, &mut retries).await;
    }

    loop {
      let deadline = retry_at.unwrap_or_else(Instant::now);
      tokio::select! {
        changed = rx.changed() => {
          if changed.is_err() {
            break;
          }
          let online = *rx.borrow_and_update();
          if online && !was_online {
            retries = 0;
            retry_at = self.flush_and_schedule(&retry, &mut retries).await;
          }
          was_online = online;
        }
        _ = self.trigger.notified() => {
          if retry_at.is_none() && connectivity.is_online() {
            retry_at = self.flush_and_schedule(&retry, &mut retries).await;
          }
        }
        _ = tokio::time::sleep_until(deadline), if retry_at.is_some() => {
          retry_at = None;
          if connectivity.is_online() {
            retry_at = self.flush_and_schedule(&retry, &mut retries).await;
          }
        }
      }
    }
  }

  async fn flush_and_schedule(&self, retry: &RetryPolicy, retries: &mut u32) -> Option<Instant> {
    let needs_retry = match self.flush().await {
      Ok(FlushOutcome::Failed { .. }) => true,
      Ok(FlushOutcome::Synced(report)) => report.rejected > 0,
      Ok(FlushOutcome::Empty) | Ok(FlushOutcome::AlreadyRunning) => false,
      Err(e) => {
        warn!(error = %e, "Flush aborted");
        true
      }
    };

    if !needs_retry {
      *retries = 0;
      return None;
    }

    *retries += 1;
    let delay = retry.delay_for_retry(*retries)?;
    debug!(retry = *retries, delay_ms = delay.as_millis() as u64, "Scheduled flush retry");
    Some(Instant::now() + delay)
  }
}

/// Split items into consecutive runs with the same credential.
fn segment_by_credential(items: &[OutboxItem]) -> Vec<&[OutboxItem]> {
  let mut segments = Vec::new();
  let mut start = 0;
  for i in 1..=items.len() {
    if i == items.len() || items[i].authorization() != items[start].authorization() {
      segments.push(&items[start..i]);
      start = i;
    }
  }
  segments
}
