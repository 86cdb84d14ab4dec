//! Mutation client: deliver writes now, or queue them for the next sync.

use color_eyre::Result;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::cache::{ResponseSnapshot, CACHE_MARKER_HEADER};
use crate::outbox::{NewOperation, OutboxStore};
use crate::sync::Connectivity;
use crate::upstream::{OutboundRequest, Upstream};

/// What happened to a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
  /// The server answered (with any status)
  Delivered(ResponseSnapshot),
  /// The operation waits in the outbox, either because the network is
  /// gone or because earlier operations are still queued
  Queued { id: i64, offline: bool },
}

impl MutationOutcome {
  /// Response handed back to the caller.
  pub fn into_response(self) -> ResponseSnapshot {
    match self {
      Self::Delivered(response) => response,
      Self::Queued { id, offline } => {
        let mut response = ResponseSnapshot::json(
          202,
          &serde_json::json!({ "queued": true, "offline": offline, "id": id }),
        );
        response.set_header(CACHE_MARKER_HEADER, "offline");
        response
      }
    }
  }
}

/// Sends mutating requests, falling back to the outbox when offline.
#[derive(Clone)]
pub struct ApiClient {
  upstream: Upstream,
  outbox: OutboxStore,
  connectivity: Connectivity,
  /// Lower-cased names of headers stored with queued operations
  forwarded_headers: Vec<String>,
  /// Wakes the sync loop when an operation is queued while online
  flush_trigger: Option<Arc<Notify>>,
}

impl ApiClient {
  pub fn new(
    upstream: Upstream,
    outbox: OutboxStore,
    connectivity: Connectivity,
    forwarded_headers: &[String],
  ) -> Self {
    Self {
      upstream,
      outbox,
      connectivity,
      forwarded_headers: forwarded_headers
        .iter()
        .map(|h| h.to_ascii_lowercase())
        .collect(),
      flush_trigger: None,
    }
  }

  pub fn with_flush_trigger(mut self, trigger: Arc<Notify>) -> Self {
    self.flush_trigger = Some(trigger);
    self
  }

  /// Send a mutation.
  ///
  /// Queued instead when the connectivity watcher says offline or the send
  /// fails with a connectivity-class error. Other failures propagate.
  ///
  /// While the outbox still holds operations, new ones queue behind them so
  /// the server sees every write in the order it was made.
  pub async fn send_mutation(&self, request: OutboundRequest) -> Result<MutationOutcome> {
    if !self.connectivity.is_online() {
      return self.enqueue(&request, true);
    }
    if !self.outbox.is_empty()? {
      debug!(url = %request.url, "Outbox not drained; queueing behind it");
      let outcome = self.enqueue(&request, false)?;
      if let Some(trigger) = &self.flush_trigger {
        trigger.notify_one();
      }
      return Ok(outcome);
    }

    match self.upstream.fetch(&request).await {
      Ok(response) => {
        self.connectivity.set_online(true);
        Ok(MutationOutcome::Delivered(response))
      }
      Err(e) if e.is_connectivity() => {
        self.connectivity.set_online(false);
        self.enqueue(&request, true)
      }
      Err(e) => Err(e.into()),
    }
  }

  fn enqueue(&self, request: &OutboundRequest, offline: bool) -> Result<MutationOutcome> {
    let url = if self.upstream.is_same_origin(&request.url) {
      match request.url.query() {
        Some(query) => format!("{}?{}", request.url.path(), query),
        None => request.url.path().to_string(),
      }
    } else {
      request.url.to_string()
    };

    let mut operation = NewOperation::new(
      &request.method,
      &url,
      NewOperation::body_from_bytes(&request.body),
    );
    for name in &self.forwarded_headers {
      if let Some(value) = request.header(name) {
        operation = operation.with_header(name, value);
      }
    }

    let id = self.outbox.enqueue(&operation)?;
    info!(id, offline, method = %operation.method, url = %operation.url, "Mutation queued");
    Ok(MutationOutcome::Queued { id, offline })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::Database;
  use crate::upstream::tests::unreachable_origin;
  use serde_json::json;
  use std::sync::Arc;
  use url::Url;
  use wiremock::matchers::method;
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn client(origin: &Url, online: bool) -> (ApiClient, OutboxStore, Connectivity) {
    let outbox = OutboxStore::new(Arc::new(Database::open_in_memory().unwrap()));
    let connectivity = Connectivity::new(online);
    let upstream = Upstream::new(origin.clone(), None).unwrap();
    let client = ApiClient::new(
      upstream,
      outbox.clone(),
      connectivity.clone(),
      &["Authorization".to_string()],
    );
    (client, outbox, connectivity)
  }

  fn create_order(origin: &Url) -> OutboundRequest {
    OutboundRequest::new("POST", origin.join("/api/orders?draft=1").unwrap())
      .with_header("Authorization", "Bearer cashier")
      .with_header("X-Trace", "abc")
      .with_json(&json!({"table": 2}))
  }

  #[tokio::test]
  async fn test_online_delivers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(201))
      .expect(1)
      .mount(&server)
      .await;
    let origin = Url::parse(&server.uri()).unwrap();
    let (client, outbox, _) = client(&origin, true);

    let outcome = client.send_mutation(create_order(&origin)).await.unwrap();
    assert!(matches!(outcome, MutationOutcome::Delivered(ref r) if r.status == 201));
    assert!(outbox.is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_known_offline_queues_without_sending() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(201))
      .expect(0)
      .mount(&server)
      .await;
    let origin = Url::parse(&server.uri()).unwrap();
    let (client, outbox, _) = client(&origin, false);

    let outcome = client.send_mutation(create_order(&origin)).await.unwrap();
    assert!(matches!(outcome, MutationOutcome::Queued { .. }));

    let items = outbox.list().unwrap();
    assert_eq!(items[0].url, "/api/orders?draft=1");
    assert_eq!(items[0].body, json!({"table": 2}));
    assert_eq!(items[0].authorization(), Some("Bearer cashier"));
    assert!(!items[0].headers.contains_key("x-trace"));
  }

  #[tokio::test]
  async fn test_connection_failure_queues_and_marks_offline() {
    let origin = unreachable_origin();
    let (client, outbox, connectivity) = client(&origin, true);

    let response = client
      .send_mutation(create_order(&origin))
      .await
      .unwrap()
      .into_response();
    assert_eq!(response.status, 202);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["queued"], true);

    assert_eq!(outbox.len().unwrap(), 1);
    assert!(!connectivity.is_online());
  }

  #[tokio::test]
  async fn test_online_mutation_queues_behind_pending_items() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(201))
      .expect(0)
      .mount(&server)
      .await;
    let origin = Url::parse(&server.uri()).unwrap();
    let (client, outbox, _) = client(&origin, true);
    let trigger = Arc::new(Notify::new());
    let client = client.with_flush_trigger(trigger.clone());

    let earlier = outbox
      .enqueue(&crate::outbox::NewOperation::new("POST", "/api/orders", json!({"id": "tmp-1"})))
      .unwrap();
    let update = OutboundRequest::new("PUT", origin.join("/api/orders/tmp-1").unwrap())
      .with_json(&json!({"status": "served"}));

    let response = client.send_mutation(update).await.unwrap().into_response();
    assert_eq!(response.status, 202);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["offline"], false);

    let items = outbox.list().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].id, earlier);
    assert_eq!(items[1].url, "/api/orders/tmp-1");

    // the stored permit resolves immediately
    tokio::time::timeout(std::time::Duration::from_secs(1), trigger.notified())
      .await
      .unwrap();
  }
}
