//! Response snapshots stored in and served from the cache.

use serde::{Deserialize, Serialize};

/// Header stamped on every response the proxy did not get straight from the network.
pub const CACHE_MARKER_HEADER: &str = "x-pos-sync-cache";

/// Headers worth keeping in a snapshot. Everything else is hop-by-hop or
/// describes a connection that no longer exists when the snapshot is served.
const KEPT_HEADERS: &[&str] = &[
  "content-type",
  "content-language",
  "cache-control",
  "etag",
  "last-modified",
  "expires",
  "location",
  "vary",
];

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOrigin {
  /// Straight from the network
  Network,
  /// Served from a cache namespace
  Cache,
  /// Built locally because neither network nor cache could answer
  Synthetic,
}

/// Status, relevant headers and body of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl ResponseSnapshot {
  pub fn new(status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
    Self {
      status,
      headers,
      body,
    }
  }

  /// JSON response with the given status.
  pub fn json(status: u16, value: &serde_json::Value) -> Self {
    Self::new(
      status,
      vec![("content-type".to_string(), "application/json".to_string())],
      value.to_string().into_bytes(),
    )
  }

  /// Synthetic 503 returned for API reads with neither network nor cache.
  pub fn offline_api() -> Self {
    let mut snapshot = Self::json(
      503,
      &serde_json::json!({ "error": "Offline", "offline": true }),
    );
    snapshot.set_header(CACHE_MARKER_HEADER, "offline");
    snapshot
  }

  /// Synthetic 504 returned for documents and assets with neither network nor cache.
  pub fn offline_gateway() -> Self {
    Self::new(
      504,
      vec![
        ("content-type".to_string(), "text/plain".to_string()),
        (CACHE_MARKER_HEADER.to_string(), "offline".to_string()),
      ],
      b"Offline".to_vec(),
    )
  }

  /// Keep only the headers worth persisting.
  pub fn retain_relevant_headers(&mut self) {
    self
      .headers
      .retain(|(name, _)| KEPT_HEADERS.contains(&name.to_ascii_lowercase().as_str()));
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn set_header(&mut self, name: &str, value: &str) {
    self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    self.headers.push((name.to_string(), value.to_string()));
  }

  /// 2xx status
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Mark a snapshot as served from cache.
  pub fn into_cache_hit(mut self) -> Self {
    self.set_header(CACHE_MARKER_HEADER, "hit");
    self
  }

  /// How this response was produced, judged by its marker header.
  pub fn origin(&self) -> ResponseOrigin {
    match self.header(CACHE_MARKER_HEADER) {
      Some("hit") => ResponseOrigin::Cache,
      Some("offline") => ResponseOrigin::Synthetic,
      _ => ResponseOrigin::Network,
    }
  }
}
