//! Canonical request identity used as the cache key.

use color_eyre::{eyre::eyre, Result};
use sha2::{Digest, Sha256};
use url::Url;

/// Canonical (method, URL) pair identifying a cached response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  method: String,
  url: String,
}

impl RequestKey {
  /// Build a key from a method and an absolute URL.
  ///
  /// The method is upper-cased and the URL fragment dropped, so `get` and
  /// `GET`, or `/orders#top` and `/orders`, share one entry.
  pub fn new(method: &str, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: method.to_ascii_uppercase(),
      url: url.to_string(),
    }
  }

  /// Shorthand for a GET key, the only method the proxy caches.
  pub fn get(url: &Url) -> Self {
    Self::new("GET", url)
  }

  /// Parse a key back from stored columns.
  pub fn from_parts(method: &str, url: &str) -> Result<Self> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid cached URL '{}': {}", url, e))?;
    Ok(Self::new(method, &url))
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  /// SHA256 hash for stable, fixed-length storage keys
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_method_and_fragment_are_normalized() {
    let a = RequestKey::new("get", &Url::parse("http://pos.local/api/orders#top").unwrap());
    let b = RequestKey::get(&Url::parse("http://pos.local/api/orders").unwrap());
    assert_eq!(a, b);
    assert_eq!(a.cache_hash(), b.cache_hash());
  }

  #[test]
  fn test_query_string_distinguishes_keys() {
    let a = RequestKey::get(&Url::parse("http://pos.local/api/orders?page=1").unwrap());
    let b = RequestKey::get(&Url::parse("http://pos.local/api/orders?page=2").unwrap());
    assert_ne!(a.cache_hash(), b.cache_hash());
  }

  #[test]
  fn test_from_parts_roundtrips() {
    let key = RequestKey::get(&Url::parse("http://pos.local/tables").unwrap());
    let parsed = RequestKey::from_parts(key.method(), key.url()).unwrap();
    assert_eq!(key, parsed);
  }
}
