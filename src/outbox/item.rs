use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A mutation to be queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOperation {
  pub method: String,
  pub url: String,
  pub body: serde_json::Value,
  /// Lower-cased header names
  pub headers: BTreeMap<String, String>,
}

impl NewOperation {
  pub fn new(method: &str, url: &str, body: serde_json::Value) -> Self {
    Self {
      method: method.to_ascii_uppercase(),
      url: url.to_string(),
      body,
      headers: BTreeMap::new(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self
      .headers
      .insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  /// Decode a raw request body: JSON when it parses, a string otherwise,
  /// null when empty.
  pub fn body_from_bytes(body: &[u8]) -> serde_json::Value {
    if body.is_empty() {
      return serde_json::Value::Null;
    }
    serde_json::from_slice(body)
      .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(body).into_owned()))
  }
}

/// A queued mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxItem {
  /// Monotonic; enqueue order
  pub id: i64,
  pub method: String,
  pub url: String,
  pub body: serde_json::Value,
  pub headers: BTreeMap<String, String>,
  pub created_at: DateTime<Utc>,
  /// Explicit server rejections so far
  pub attempts: u32,
  pub last_error: Option<String>,
}

impl OutboxItem {
  pub fn authorization(&self) -> Option<&str> {
    self.headers.get("authorization").map(String::as_str)
  }
}

/// An item taken out of the outbox by the attempt or age cap.
#[derive(Debug, Clone)]
pub struct DeadLetter {
  pub item: OutboxItem,
  pub reason: String,
  pub dead_at: DateTime<Utc>,
}
