//! HTTP front end: binds the cache manager to a TCP listener.
//!
//! Endpoints:
//! - POST {control}/messages - deliver a `ClientCommand`
//! - GET {control}/events - `ManagerMessage` stream as server-sent events
//! - anything else - proxied through [`CacheManager::handle`]

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use axum::{
  body::Body,
  extract::{Request, State},
  http::StatusCode,
  response::{
    sse::{Event, KeepAlive, Sse},
    IntoResponse, Json, Response,
  },
  routing::{get, post},
  Router,
};
use color_eyre::{eyre::eyre, Result};
use futures::stream::{self, Stream};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use url::Url;

use crate::cache::ResponseSnapshot;
use crate::manager::{CacheManager, ClientCommand};
use crate::upstream::{OutboundRequest, Upstream};

/// Largest request body the proxy buffers.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub fn router(manager: Arc<CacheManager>, control_prefix: &str) -> Router {
  let prefix = control_prefix.trim_end_matches('/');
  Router::new()
    .route(&format!("{}/messages", prefix), post(post_message))
    .route(&format!("{}/events", prefix), get(events))
    .fallback(proxy)
    .with_state(manager)
}

pub async fn bind(listen: &str) -> Result<TcpListener> {
  TcpListener::bind(listen)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", listen, e))
}

/// Serve until `shutdown` resolves.
pub async fn serve(
  listener: TcpListener,
  manager: Arc<CacheManager>,
  control_prefix: &str,
  shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
  let address = listener
    .local_addr()
    .map_err(|e| eyre!("Failed to read listener address: {}", e))?;
  info!(address = %address, upstream = %manager.upstream().origin(), "Proxy listening");

  axum::serve(listener, router(manager, control_prefix))
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|e| eyre!("Server error: {}", e))
}

async fn post_message(
  State(manager): State<Arc<CacheManager>>,
  Json(command): Json<ClientCommand>,
) -> Response {
  match manager.handle_command(command) {
    Ok(_) => StatusCode::ACCEPTED.into_response(),
    Err(e) => (
      StatusCode::INTERNAL_SERVER_ERROR,
      Json(serde_json::json!({ "error": e.to_string() })),
    )
      .into_response(),
  }
}

async fn events(
  State(manager): State<Arc<CacheManager>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
  let rx = manager.bus().subscribe();
  let stream = stream::unfold(rx, |mut rx| async move {
    loop {
      match rx.recv().await {
        Ok(message) => match Event::default().json_data(&message) {
          Ok(event) => return Some((Ok(event), rx)),
          Err(e) => warn!(error = %e, "Failed to encode event"),
        },
        Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event subscriber lagged"),
        Err(RecvError::Closed) => return None,
      }
    }
  });
  Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn proxy(State(manager): State<Arc<CacheManager>>, request: Request) -> Response {
  let outbound = match to_outbound(manager.upstream(), request).await {
    Ok(outbound) => outbound,
    Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
  };

  match manager.handle(outbound).await {
    Ok(snapshot) => to_response(snapshot),
    Err(e) => {
      warn!(error = %e, "Proxy request failed");
      (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
    }
  }
}

/// Origin-form targets are resolved against the upstream; absolute-form
/// targets are kept as they are.
async fn to_outbound(upstream: &Upstream, request: Request) -> Result<OutboundRequest> {
  let (parts, body) = request.into_parts();

  let url = if parts.uri.scheme().is_some() {
    Url::parse(&parts.uri.to_string()).map_err(|e| eyre!("Invalid URL '{}': {}", parts.uri, e))?
  } else {
    let target = parts
      .uri
      .path_and_query()
      .map(|pq| pq.as_str())
      .unwrap_or("/");
    upstream.resolve(target)?
  };

  let mut outbound = OutboundRequest::new(parts.method.as_str(), url);
  for (name, value) in &parts.headers {
    if let Ok(value) = value.to_str() {
      outbound = outbound.with_header(name.as_str(), value);
    }
  }
  outbound.body = axum::body::to_bytes(body, MAX_BODY_BYTES)
    .await
    .map_err(|e| eyre!("Failed to read request body: {}", e))?
    .to_vec();

  Ok(outbound)
}

fn to_response(snapshot: ResponseSnapshot) -> Response {
  let mut builder = Response::builder().status(snapshot.status);
  for (name, value) in &snapshot.headers {
    builder = builder.header(name.as_str(), value.as_str());
  }
  builder.body(Body::from(snapshot.body)).unwrap_or_else(|e| {
    warn!(error = %e, "Upstream response could not be relayed");
    StatusCode::BAD_GATEWAY.into_response()
  })
}
