//! Wire types for the batch reconciliation endpoint.

use serde::{Deserialize, Serialize};

use crate::outbox::OutboxItem;

/// One replayed mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
  pub method: String,
  pub url: String,
  pub body: serde_json::Value,
}

impl From<&OutboxItem> for SyncOperation {
  fn from(item: &OutboxItem) -> Self {
    Self {
      method: item.method.clone(),
      url: item.url.clone(),
      body: item.body.clone(),
    }
  }
}

/// `{ "operations": [...] }`, in enqueue order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncBatchRequest {
  pub operations: Vec<SyncOperation>,
}

impl SyncBatchRequest {
  pub fn from_items(items: &[OutboxItem]) -> Self {
    Self {
      operations: items.iter().map(SyncOperation::from).collect(),
    }
  }
}

/// Per-operation outcome. Only an explicit `"success": false` is a rejection;
/// anything else, including a missing entry, confirms the operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchResult(pub serde_json::Value);

impl BatchResult {
  pub fn is_rejected(&self) -> bool {
    self.0.get("success") == Some(&serde_json::Value::Bool(false))
  }

  /// Server-supplied reason, if any.
  pub fn error(&self) -> Option<String> {
    match self.0.get("error")? {
      serde_json::Value::String(s) => Some(s.clone()),
      serde_json::Value::Null => None,
      other => Some(other.to_string()),
    }
  }
}

/// `{ "results": [...] }`, positionally aligned to the request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncBatchResponse {
  #[serde(default)]
  pub results: Vec<BatchResult>,
}

impl SyncBatchResponse {
  /// Whether the operation at `index` was explicitly rejected.
  pub fn is_rejected(&self, index: usize) -> bool {
    self
      .results
      .get(index)
      .map(BatchResult::is_rejected)
      .unwrap_or(false)
  }

  pub fn error(&self, index: usize) -> Option<String> {
    self.results.get(index).and_then(BatchResult::error)
  }
}
