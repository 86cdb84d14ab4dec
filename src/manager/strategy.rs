//! One handler per request class.

use color_eyre::Result;
use serde::Deserialize;
use tracing::{debug, warn};

use super::CacheManager;
use crate::cache::{prune, RequestKey, ResponseSnapshot};
use crate::upstream::{FetchError, OutboundRequest};

/// Body of the maintenance command.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PruneCommand {
  max_entries: Option<usize>,
}

impl CacheManager {
  /// Send to the network and feed the outcome to the connectivity watcher.
  async fn fetch_network(&self, request: &OutboundRequest) -> Result<ResponseSnapshot, FetchError> {
    match self.upstream.fetch(request).await {
      Ok(response) => {
        self.connectivity.set_online(true);
        Ok(response)
      }
      Err(e) => {
        if e.is_connectivity() {
          self.connectivity.set_online(false);
        }
        debug!(url = %request.url, error = %e, "Network fetch failed");
        Err(e)
      }
    }
  }

  /// Cached copy for `key` in the active namespace, marked as a cache hit.
  fn cached(&self, key: &RequestKey) -> Option<ResponseSnapshot> {
    let namespace = self.active_namespace().ok()??;
    match self.storage.get(&namespace, key) {
      Ok(hit) => hit.map(|c| c.snapshot.into_cache_hit()),
      Err(e) => {
        warn!(url = key.url(), error = %e, "Cache lookup failed");
        None
      }
    }
  }

  /// Store a response and prune best-effort. Failures never reach the caller.
  fn store(&self, key: &RequestKey, response: &ResponseSnapshot, max_entries: usize) {
    let namespace = match self.active_namespace() {
      Ok(Some(namespace)) => namespace,
      _ => return,
    };

    let mut snapshot = response.clone();
    snapshot.retain_relevant_headers();
    if let Err(e) = self.storage.put(&namespace, key, &snapshot) {
      warn!(url = key.url(), error = %e, "Failed to cache response");
      return;
    }
    if let Err(e) = prune(self.storage.as_ref(), &namespace, max_entries) {
      warn!(namespace = %namespace, error = %e, "Failed to prune cache");
    }
  }

  /// Network-first; refresh the cached document and the app shell on success,
  /// fall back to the cached document, then the cached app shell.
  pub(super) async fn handle_navigation(&self, request: &OutboundRequest) -> Result<ResponseSnapshot> {
    let key = RequestKey::get(&request.url);
    let shell = RequestKey::get(&self.upstream.resolve(&self.shell_path)?);
    match self.fetch_network(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store(&key, &response, self.cache.static_max_entries);
          if shell != key {
            self.store(&shell, &response, self.cache.static_max_entries);
          }
        }
        Ok(response)
      }
      Err(_) => {
        if let Some(hit) = self.cached(&key) {
          return Ok(hit);
        }
        Ok(self.cached(&shell).unwrap_or_else(ResponseSnapshot::offline_gateway))
      }
    }
  }

  /// Prune the active namespace to `maxEntries` (default: the API cap).
  pub(super) fn handle_maintenance(&self, request: &OutboundRequest) -> ResponseSnapshot {
    let command: PruneCommand = if request.body.is_empty() {
      PruneCommand::default()
    } else {
      match serde_json::from_slice(&request.body) {
        Ok(command) => command,
        Err(e) => return maintenance_error(400, &format!("Invalid prune command: {}", e)),
      }
    };
    let max_entries = command.max_entries.unwrap_or(self.cache.api_max_entries);

    let namespace = match self.active_namespace() {
      Ok(Some(namespace)) => namespace,
      Ok(None) => return maintenance_error(409, "No active cache"),
      Err(e) => return maintenance_error(500, &e.to_string()),
    };

    match prune(self.storage.as_ref(), &namespace, max_entries) {
      Ok(report) => ResponseSnapshot::json(
        200,
        &serde_json::json!({
          "success": true,
          "message": format!(
            "Removed {} of {} entries; {} remain",
            report.removed,
            report.before,
            report.remaining()
          ),
        }),
      ),
      Err(e) => maintenance_error(500, &e.to_string()),
    }
  }

  /// Network-first; cache and evict on success, cached copy or 503 on failure.
  pub(super) async fn handle_api_read(&self, request: &OutboundRequest) -> Result<ResponseSnapshot> {
    let key = RequestKey::get(&request.url);
    match self.fetch_network(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store(&key, &response, self.cache.api_max_entries);
        }
        Ok(response)
      }
      Err(_) => Ok(self.cached(&key).unwrap_or_else(ResponseSnapshot::offline_api)),
    }
  }

  /// Cache-first; on a miss fetch, cache 200s and evict.
  pub(super) async fn handle_static_asset(&self, request: &OutboundRequest) -> Result<ResponseSnapshot> {
    let key = RequestKey::get(&request.url);
    if let Some(hit) = self.cached(&key) {
      return Ok(hit);
    }

    match self.fetch_network(request).await {
      Ok(response) => {
        if response.status == 200 {
          self.store(&key, &response, self.cache.static_max_entries);
        }
        Ok(response)
      }
      Err(_) => Ok(ResponseSnapshot::offline_gateway()),
    }
  }

  /// Network-first; 200s are kept under the static cap for offline use.
  pub(super) async fn handle_cross_origin(&self, request: &OutboundRequest) -> Result<ResponseSnapshot> {
    let key = RequestKey::get(&request.url);
    match self.upstream.fetch(request).await {
      Ok(response) => {
        if response.status == 200 {
          self.store(&key, &response, self.cache.static_max_entries);
        }
        Ok(response)
      }
      Err(_) => Ok(self.cached(&key).unwrap_or_else(ResponseSnapshot::offline_gateway)),
    }
  }

  /// Forward untouched; a connectivity failure becomes a synthetic 504.
  pub(super) async fn handle_passthrough(&self, request: &OutboundRequest) -> Result<ResponseSnapshot> {
    match self.fetch_network(request).await {
      Ok(response) => Ok(response),
      Err(e) if e.is_connectivity() => Ok(ResponseSnapshot::offline_gateway()),
      Err(e) => Err(e.into()),
    }
  }
}

fn maintenance_error(status: u16, error: &str) -> ResponseSnapshot {
  ResponseSnapshot::json(status, &serde_json::json!({ "success": false, "error": error }))
}

#[cfg(test)]
mod tests {
  use super::super::test_support::*;
  use crate::cache::{CacheStorage, NamespaceState, ResponseOrigin, SqliteStorage};
  use crate::db::Database;
  use crate::upstream::OutboundRequest;
  use std::sync::Arc;
  use std::time::Duration;
  use url::Url;
  use wiremock::matchers::{any, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  const SHORT: Option<Duration> = Some(Duration::from_millis(200));

  /// Harness whose `pos-v1` namespace is already active.
  fn active(origin: &str) -> Harness {
    let db = Arc::new(Database::open_in_memory().unwrap());
    SqliteStorage::new(db.clone())
      .create_namespace("pos-v1", "v1", NamespaceState::Active)
      .unwrap();
    harness_with_db(origin, cache_config(&[]), db)
  }

  async fn mock_get(server: &MockServer, p: &str, status: u16, body: &str) {
    Mock::given(method("GET"))
      .and(path(p.to_string()))
      .respond_with(ResponseTemplate::new(status).set_body_string(body.to_string()))
      .mount(server)
      .await;
  }

  /// Make every further request to `server` hang past [`SHORT`].
  async fn stall(server: &MockServer) {
    server.reset().await;
    Mock::given(any())
      .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
      .mount(server)
      .await;
  }

  #[tokio::test]
  async fn test_api_read_caches_then_serves_offline() {
    let server = MockServer::start().await;
    mock_get(&server, "/api/orders", 200, "[\"order-1\"]").await;
    let h = active(&server.uri());

    let online = h.manager.handle(request(&h, "GET", "/api/orders")).await.unwrap();
    assert_eq!(online.origin(), ResponseOrigin::Network);
    assert_eq!(h.storage.count("pos-v1").unwrap(), 1);

    stall(&server).await;
    let offline = h
      .manager
      .handle(request(&h, "GET", "/api/orders").with_timeout(SHORT))
      .await
      .unwrap();
    assert_eq!(offline.status, 200);
    assert_eq!(offline.body, b"[\"order-1\"]");
    assert_eq!(offline.origin(), ResponseOrigin::Cache);
    assert!(!h.connectivity.is_online());
  }

  #[tokio::test]
  async fn test_api_read_without_cache_is_synthetic_503() {
    let h = active("http://127.0.0.1:9/");
    let response = h.manager.handle(request(&h, "GET", "/api/tables")).await.unwrap();
    assert_eq!(response.status, 503);
    assert_eq!(response.origin(), ResponseOrigin::Synthetic);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["offline"], true);
  }

  #[tokio::test]
  async fn test_api_errors_are_not_cached() {
    let server = MockServer::start().await;
    mock_get(&server, "/api/orders", 500, "boom").await;
    let h = active(&server.uri());

    let response = h.manager.handle(request(&h, "GET", "/api/orders")).await.unwrap();
    assert_eq!(response.status, 500);
    assert_eq!(h.storage.count("pos-v1").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_api_reads_evict_to_cap() {
    let server = MockServer::start().await;
    for i in 0..5 {
      mock_get(&server, &format!("/api/items/{}", i), 200, "{}").await;
    }
    let h = active(&server.uri());

    for i in 0..5 {
      h.manager
        .handle(request(&h, "GET", &format!("/api/items/{}", i)))
        .await
        .unwrap();
    }

    let keys = h.storage.keys("pos-v1").unwrap();
    assert_eq!(keys.len(), 3);
    assert!(keys[0].url().ends_with("/api/items/2"));
    assert!(keys[2].url().ends_with("/api/items/4"));
  }

  #[tokio::test]
  async fn test_static_asset_is_cache_first() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/assets/app.js"))
      .respond_with(ResponseTemplate::new(200).set_body_string("console.log(1)"))
      .expect(1)
      .mount(&server)
      .await;
    let h = active(&server.uri());

    let first = h.manager.handle(request(&h, "GET", "/assets/app.js")).await.unwrap();
    let second = h.manager.handle(request(&h, "GET", "/assets/app.js")).await.unwrap();
    assert_eq!(first.origin(), ResponseOrigin::Network);
    assert_eq!(second.origin(), ResponseOrigin::Cache);
    assert_eq!(second.body, b"console.log(1)");
  }

  #[tokio::test]
  async fn test_static_miss_offline_is_synthetic_504() {
    let h = active("http://127.0.0.1:9/");
    let response = h.manager.handle(request(&h, "GET", "/assets/app.js")).await.unwrap();
    assert_eq!(response.status, 504);
    assert_eq!(response.origin(), ResponseOrigin::Synthetic);
  }

  #[tokio::test]
  async fn test_static_non_200_not_cached() {
    let server = MockServer::start().await;
    mock_get(&server, "/assets/missing.js", 404, "").await;
    let h = active(&server.uri());

    let response = h.manager.handle(request(&h, "GET", "/assets/missing.js")).await.unwrap();
    assert_eq!(response.status, 404);
    assert_eq!(h.storage.count("pos-v1").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_navigation_falls_back_to_shell() {
    let server = MockServer::start().await;
    mock_get(&server, "/index.html", 200, "<html>shell</html>").await;
    let h = active(&server.uri());

    h.manager
      .handle(request(&h, "GET", "/index.html").with_header("accept", "text/html"))
      .await
      .unwrap();

    stall(&server).await;
    let response = h
      .manager
      .handle(
        request(&h, "GET", "/inventory")
          .with_header("accept", "text/html")
          .with_timeout(SHORT),
      )
      .await
      .unwrap();
    assert_eq!(response.body, b"<html>shell</html>");
    assert_eq!(response.origin(), ResponseOrigin::Cache);
  }

  /// Navigate to `p` as a browser document request.
  fn navigate(h: &Harness, p: &str) -> OutboundRequest {
    request(h, "GET", p)
      .with_header("accept", "text/html")
      .with_timeout(SHORT)
  }

  #[tokio::test]
  async fn test_online_navigation_refreshes_installed_shell() {
    let server = MockServer::start().await;
    mock_get(&server, "/index.html", 200, "shell v1").await;
    let h = harness(&server.uri(), cache_config(&["/index.html"]));
    h.manager.install().await.unwrap();

    server.reset().await;
    mock_get(&server, "/orders", 200, "shell v2").await;
    let online = h.manager.handle(navigate(&h, "/orders")).await.unwrap();
    assert_eq!(online.origin(), ResponseOrigin::Network);

    stall(&server).await;
    let offline = h.manager.handle(navigate(&h, "/tables")).await.unwrap();
    assert_eq!(offline.status, 200);
    assert_eq!(offline.body, b"shell v2");
    assert_eq!(offline.origin(), ResponseOrigin::Cache);
  }

  #[tokio::test]
  async fn test_installed_shell_outlives_api_cap() {
    let server = MockServer::start().await;
    mock_get(&server, "/index.html", 200, "shell v1").await;
    for i in 0..5 {
      mock_get(&server, &format!("/api/items/{}", i), 200, "{}").await;
    }
    let h = harness(&server.uri(), cache_config(&["/index.html"]));
    h.manager.install().await.unwrap();

    for i in 0..5 {
      h.manager
        .handle(request(&h, "GET", &format!("/api/items/{}", i)))
        .await
        .unwrap();
    }
    let keys = h.storage.keys("pos-v1").unwrap();
    assert_eq!(keys.len(), 4);
    assert!(keys[0].url().ends_with("/index.html"));

    stall(&server).await;
    let offline = h.manager.handle(navigate(&h, "/tables")).await.unwrap();
    assert_eq!(offline.status, 200);
    assert_eq!(offline.body, b"shell v1");
    assert_eq!(offline.origin(), ResponseOrigin::Cache);
  }

  #[tokio::test]
  async fn test_navigation_without_any_cache_is_504() {
    let h = active("http://127.0.0.1:9/");
    let response = h
      .manager
      .handle(request(&h, "GET", "/orders").with_header("accept", "text/html"))
      .await
      .unwrap();
    assert_eq!(response.status, 504);
  }

  #[tokio::test]
  async fn test_cross_origin_falls_back_to_cached_copy() {
    let cdn = MockServer::start().await;
    mock_get(&cdn, "/font.woff2", 200, "font").await;
    let h = active("http://127.0.0.1:9/");
    let font = Url::parse(&cdn.uri()).unwrap().join("/font.woff2").unwrap();

    let online = h.manager.handle(OutboundRequest::get(font.clone())).await.unwrap();
    assert_eq!(online.origin(), ResponseOrigin::Network);

    stall(&cdn).await;
    let offline = h
      .manager
      .handle(OutboundRequest::get(font).with_timeout(SHORT))
      .await
      .unwrap();
    assert_eq!(offline.body, b"font");
    assert_eq!(offline.origin(), ResponseOrigin::Cache);
  }

  #[tokio::test]
  async fn test_passthrough_offline_is_504() {
    let h = active("http://127.0.0.1:9/");
    let response = h.manager.handle(request(&h, "POST", "/login")).await.unwrap();
    assert_eq!(response.status, 504);
    assert!(!h.connectivity.is_online());
  }

  #[tokio::test]
  async fn test_maintenance_prunes_active_namespace() {
    let server = MockServer::start().await;
    for i in 0..3 {
      mock_get(&server, &format!("/api/items/{}", i), 200, "{}").await;
    }
    let h = active(&server.uri());
    for i in 0..3 {
      h.manager
        .handle(request(&h, "GET", &format!("/api/items/{}", i)))
        .await
        .unwrap();
    }

    let mut command = request(&h, "POST", "/__pos-sync/prune");
    command.body = br#"{"maxEntries": 1}"#.to_vec();
    let response = h.manager.handle(command).await.unwrap();

    assert_eq!(response.status, 200);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(h.storage.count("pos-v1").unwrap(), 1);
    assert!(h.storage.keys("pos-v1").unwrap()[0].url().ends_with("/api/items/2"));
  }

  #[tokio::test]
  async fn test_maintenance_rejects_bad_body() {
    let h = active("http://127.0.0.1:9/");
    let mut command = request(&h, "POST", "/__pos-sync/prune");
    command.body = b"not json".to_vec();

    let response = h.manager.handle(command).await.unwrap();
    assert_eq!(response.status, 400);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["success"], false);
    assert!(body["error"].is_string());
  }

  #[tokio::test]
  async fn test_maintenance_without_active_namespace() {
    let h = harness("http://127.0.0.1:9/", cache_config(&[]));
    let response = h.manager.handle(request(&h, "POST", "/__pos-sync/prune")).await.unwrap();
    assert_eq!(response.status, 409);
  }
}
