//! Caching proxy manager.
//!
//! Every request from a foreground context passes through
//! [`CacheManager::handle`], which classifies it and applies that class's
//! strategy against the active cache namespace. The manager also owns the
//! namespace lifecycle (install, wait, activate, garbage-collect) and the
//! message channel to foreground contexts.

mod classify;
mod lifecycle;
mod messages;
mod prefetch;
mod strategy;

use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::api::ApiClient;
use crate::cache::{CacheStorage, NamespaceState, ResponseSnapshot};
use crate::config::{CacheConfig, ProxyConfig};
use crate::sync::Connectivity;
use crate::upstream::{OutboundRequest, Upstream};

pub use classify::{ClassifyRules, RequestClass};
pub use lifecycle::{ActivateOutcome, InstallOutcome};
pub use messages::{ClientCommand, ManagerMessage, MessageBus};
pub use prefetch::PrefetchSummary;

/// Which namespaces currently hold which role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Lifecycle {
  active: Option<String>,
  waiting: Option<String>,
}

/// The caching proxy. Cheap to share behind an `Arc`.
pub struct CacheManager {
  storage: Arc<dyn CacheStorage>,
  upstream: Upstream,
  api: ApiClient,
  connectivity: Connectivity,
  cache: CacheConfig,
  rules: ClassifyRules,
  shell_path: String,
  lifecycle: RwLock<Lifecycle>,
  bus: MessageBus,
}

impl CacheManager {
  /// Create a manager, picking up namespace roles left by a previous run.
  pub fn new(
    storage: Arc<dyn CacheStorage>,
    upstream: Upstream,
    api: ApiClient,
    connectivity: Connectivity,
    cache: CacheConfig,
    proxy: &ProxyConfig,
  ) -> Result<Self> {
    let mut lifecycle = Lifecycle::default();
    for namespace in storage.namespaces()? {
      match namespace.state {
        NamespaceState::Active => lifecycle.active = Some(namespace.name),
        NamespaceState::Waiting => lifecycle.waiting = Some(namespace.name),
        // interrupted installs and leftovers are garbage
        NamespaceState::Installing | NamespaceState::Superseded => {
          storage.delete_namespace(&namespace.name)?;
        }
      }
    }
    debug!(?lifecycle, "Loaded cache lifecycle");

    let rules = ClassifyRules {
      origin: upstream.origin().clone(),
      api_prefix: proxy.api_prefix.clone(),
      maintenance_path: proxy.maintenance_path.clone(),
    };

    Ok(Self {
      storage,
      upstream,
      api,
      connectivity,
      cache,
      rules,
      shell_path: proxy.shell_path.clone(),
      lifecycle: RwLock::new(lifecycle),
      bus: MessageBus::new(),
    })
  }

  pub fn bus(&self) -> &MessageBus {
    &self.bus
  }

  pub fn storage(&self) -> &dyn CacheStorage {
    self.storage.as_ref()
  }

  pub fn upstream(&self) -> &Upstream {
    &self.upstream
  }

  /// Namespace serving requests, if any generation is active.
  pub fn active_namespace(&self) -> Result<Option<String>> {
    Ok(self.read_lifecycle()?.active)
  }

  /// Namespace installed and waiting for cutover, if any.
  pub fn waiting_namespace(&self) -> Result<Option<String>> {
    Ok(self.read_lifecycle()?.waiting)
  }

  fn read_lifecycle(&self) -> Result<Lifecycle> {
    self
      .lifecycle
      .read()
      .map(|l| l.clone())
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn write_lifecycle(&self, f: impl FnOnce(&mut Lifecycle)) -> Result<()> {
    let mut lifecycle = self
      .lifecycle
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    f(&mut lifecycle);
    Ok(())
  }

  /// Handle one intercepted request.
  pub async fn handle(&self, request: OutboundRequest) -> Result<ResponseSnapshot> {
    let class = self.rules.classify(&request);
    debug!(method = %request.method, url = %request.url, ?class, "Intercepted request");

    match class {
      RequestClass::Navigation => self.handle_navigation(&request).await,
      RequestClass::Maintenance => Ok(self.handle_maintenance(&request)),
      RequestClass::ApiRead => self.handle_api_read(&request).await,
      RequestClass::StaticAsset => self.handle_static_asset(&request).await,
      RequestClass::CrossOrigin => self.handle_cross_origin(&request).await,
      RequestClass::Mutation => Ok(self.api.send_mutation(request).await?.into_response()),
      RequestClass::Passthrough => self.handle_passthrough(&request).await,
    }
  }

  /// Apply a foreground command.
  ///
  /// Prefetch runs on its own task and is not cancellable once started; the
  /// handle is returned for callers that want to wait for it.
  pub fn handle_command(self: &Arc<Self>, command: ClientCommand) -> Result<Option<JoinHandle<()>>> {
    match command {
      ClientCommand::SkipWaiting => {
        self.skip_waiting()?;
        Ok(None)
      }
      ClientCommand::CacheUrls { urls } => {
        let manager = Arc::clone(self);
        Ok(Some(tokio::spawn(async move {
          if let Err(e) = manager.prefetch(&urls).await {
            warn!(error = %e, "Prefetch failed");
          }
        })))
      }
    }
  }
}
