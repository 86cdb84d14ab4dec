//! HTTP client for the POS backend and any other origin the proxy forwards to.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::cache::ResponseSnapshot;

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
  "host",
  "connection",
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "proxy-connection",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
  "content-length",
  // reqwest decodes compressed bodies, so the original encoding no longer applies
  "content-encoding",
];

/// Why a request produced no response.
#[derive(Debug, Error)]
pub enum FetchError {
  /// The connectivity watcher reports offline; nothing was sent.
  #[error("offline")]
  Offline,
  /// Connect failure, DNS failure or timeout.
  #[error("connection failed: {0}")]
  Connectivity(#[source] reqwest::Error),
  /// Any other transport or protocol failure.
  #[error("request failed: {0}")]
  Transport(#[source] reqwest::Error),
  #[error("invalid HTTP method '{0}'")]
  InvalidMethod(String),
}

impl FetchError {
  /// Connectivity-class failures are the ones the outbox absorbs.
  pub fn is_connectivity(&self) -> bool {
    matches!(self, Self::Offline | Self::Connectivity(_))
  }

  fn from_reqwest(e: reqwest::Error) -> Self {
    if e.is_connect() || e.is_timeout() {
      Self::Connectivity(e)
    } else {
      Self::Transport(e)
    }
  }
}

/// A request on its way to the network.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
  pub method: String,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub timeout: Option<Duration>,
}

impl OutboundRequest {
  pub fn new(method: &str, url: Url) -> Self {
    Self {
      method: method.to_ascii_uppercase(),
      url,
      headers: Vec::new(),
      body: Vec::new(),
      timeout: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new("GET", url)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn with_json(mut self, value: &serde_json::Value) -> Self {
    self.body = value.to_string().into_bytes();
    self.with_header("content-type", "application/json")
  }

  pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// Upstream HTTP client wrapper
#[derive(Clone)]
pub struct Upstream {
  client: reqwest::Client,
  origin: Url,
}

impl Upstream {
  pub fn new(origin: Url, timeout: Option<Duration>) -> Result<Self> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
      builder = builder.timeout(timeout);
    }
    let client = builder
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, origin })
  }

  /// Origin that counts as same-origin for request classification.
  pub fn origin(&self) -> &Url {
    &self.origin
  }

  /// Resolve a path (or absolute URL) against the upstream origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid URL '{}': {}", path, e))
  }

  /// Whether `url` shares the upstream's scheme, host and port.
  pub fn is_same_origin(&self, url: &Url) -> bool {
    url.origin() == self.origin.origin()
  }

  /// Send a request and capture the whole response.
  ///
  /// Any HTTP status is a successful fetch; only transport failures are errors.
  pub async fn fetch(&self, request: &OutboundRequest) -> Result<ResponseSnapshot, FetchError> {
    let method = Method::from_bytes(request.method.as_bytes())
      .map_err(|_| FetchError::InvalidMethod(request.method.clone()))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      if !is_hop_by_hop(name) {
        builder = builder.header(name.as_str(), value.as_str());
      }
    }
    if !request.body.is_empty() {
      builder = builder.body(request.body.clone());
    }
    if let Some(timeout) = request.timeout {
      builder = builder.timeout(timeout);
    }

    let response = builder.send().await.map_err(FetchError::from_reqwest)?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(FetchError::from_reqwest)?
      .to_vec();

    Ok(ResponseSnapshot::new(status, headers, body))
  }
}

fn is_hop_by_hop(name: &str) -> bool {
  HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}
