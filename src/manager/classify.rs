//! Request classification.

use crate::upstream::OutboundRequest;
use url::Url;

/// How the proxy treats a request. Each class has exactly one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// HTML document load: network-first, cached shell on failure
  Navigation,
  /// Local prune command, never proxied
  Maintenance,
  /// GET under the API prefix: network-first, cache + evict on success
  ApiRead,
  /// Other same-origin GET: cache-first
  StaticAsset,
  /// GET to another origin: network-first
  CrossOrigin,
  /// Write under the API prefix: forwarded, or queued when offline
  Mutation,
  /// Anything else: forwarded untouched
  Passthrough,
}

/// Inputs the decision table needs besides the request itself.
#[derive(Debug, Clone)]
pub struct ClassifyRules {
  pub origin: Url,
  pub api_prefix: String,
  pub maintenance_path: String,
}

impl ClassifyRules {
  /// Evaluate the decision table in priority order.
  pub fn classify(&self, request: &OutboundRequest) -> RequestClass {
    let same_origin = request.url.origin() == self.origin.origin();
    let path = request.url.path();
    let is_get = request.method == "GET";

    if is_get && is_navigation(request) {
      return RequestClass::Navigation;
    }
    if same_origin && request.method == "POST" && path == self.maintenance_path {
      return RequestClass::Maintenance;
    }
    if same_origin && is_get && path.starts_with(&self.api_prefix) {
      return RequestClass::ApiRead;
    }
    if same_origin && is_get {
      return RequestClass::StaticAsset;
    }
    if is_get {
      return RequestClass::CrossOrigin;
    }
    if same_origin && request.method != "HEAD" && path.starts_with(&self.api_prefix) {
      return RequestClass::Mutation;
    }
    RequestClass::Passthrough
  }
}

/// Browsers mark document loads with `Sec-Fetch-Mode: navigate`; other
/// clients are recognised by asking for HTML.
fn is_navigation(request: &OutboundRequest) -> bool {
  if let Some(mode) = request.header("sec-fetch-mode") {
    return mode.eq_ignore_ascii_case("navigate");
  }
  request
    .header("accept")
    .map(|accept| accept.contains("text/html"))
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn rules() -> ClassifyRules {
    ClassifyRules {
      origin: Url::parse("http://pos.local:3000/").unwrap(),
      api_prefix: "/api/".to_string(),
      maintenance_path: "/__pos-sync/prune".to_string(),
    }
  }

  fn request(method: &str, url: &str) -> OutboundRequest {
    OutboundRequest::new(method, Url::parse(url).unwrap())
  }

  #[test]
  fn test_navigation_wins_over_api_prefix() {
    let req = request("GET", "http://pos.local:3000/api/report").with_header("Accept", "text/html,*/*");
    assert_eq!(rules().classify(&req), RequestClass::Navigation);

    let req = request("GET", "http://pos.local:3000/orders").with_header("Sec-Fetch-Mode", "navigate");
    assert_eq!(rules().classify(&req), RequestClass::Navigation);
  }

  #[test]
  fn test_fetch_mode_overrides_accept() {
    let req = request("GET", "http://pos.local:3000/partial")
      .with_header("Sec-Fetch-Mode", "cors")
      .with_header("Accept", "text/html");
    assert_eq!(rules().classify(&req), RequestClass::StaticAsset);
  }

  #[test]
  fn test_maintenance() {
    let req = request("POST", "http://pos.local:3000/__pos-sync/prune");
    assert_eq!(rules().classify(&req), RequestClass::Maintenance);
    let req = request("GET", "http://pos.local:3000/__pos-sync/prune");
    assert_eq!(rules().classify(&req), RequestClass::StaticAsset);
  }

  #[test]
  fn test_api_read_and_static() {
    assert_eq!(
      rules().classify(&request("GET", "http://pos.local:3000/api/orders?open=1")),
      RequestClass::ApiRead
    );
    assert_eq!(
      rules().classify(&request("GET", "http://pos.local:3000/assets/app.js")),
      RequestClass::StaticAsset
    );
  }

  #[test]
  fn test_cross_origin() {
    assert_eq!(
      rules().classify(&request("GET", "https://fonts.example/inter.woff2")),
      RequestClass::CrossOrigin
    );
    // a different port is a different origin
    assert_eq!(
      rules().classify(&request("GET", "http://pos.local:4000/api/orders")),
      RequestClass::CrossOrigin
    );
  }

  #[test]
  fn test_mutations_and_passthrough() {
    for method in ["POST", "PUT", "PATCH", "DELETE"] {
      assert_eq!(
        rules().classify(&request(method, "http://pos.local:3000/api/orders/1")),
        RequestClass::Mutation
      );
    }
    assert_eq!(
      rules().classify(&request("POST", "http://pos.local:3000/login")),
      RequestClass::Passthrough
    );
    assert_eq!(
      rules().classify(&request("HEAD", "http://pos.local:3000/api/orders")),
      RequestClass::Passthrough
    );
    assert_eq!(
      rules().classify(&request("POST", "https://other.example/api/orders")),
      RequestClass::Passthrough
    );
  }
}
