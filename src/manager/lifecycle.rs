//! Generation lifecycle: installing -> waiting -> active -> superseded.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use tracing::{info, warn};

use super::messages::ManagerMessage;
use super::CacheManager;
use crate::cache::{NamespaceState, RequestKey, ResponseSnapshot};
use crate::upstream::OutboundRequest;

/// Result of [`CacheManager::install`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
  /// No generation was active, so the new one took over immediately
  Activated,
  /// Installed; an older generation keeps serving until cutover
  Waiting,
  /// This generation is already installed
  AlreadyInstalled(NamespaceState),
}

/// Result of [`CacheManager::activate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateOutcome {
  pub namespace: String,
  /// Namespaces garbage-collected by the cutover
  pub removed: Vec<String>,
}

impl CacheManager {
  /// Pre-load the manifest into this build's namespace.
  ///
  /// All-or-nothing: if any manifest resource fails to fetch or answers
  /// with a non-2xx status, the namespace is deleted and an error returned.
  pub async fn install(&self) -> Result<InstallOutcome> {
    let namespace = self.cache.namespace();
    let lifecycle = self.read_lifecycle()?;
    if lifecycle.active.as_deref() == Some(namespace.as_str()) {
      return Ok(InstallOutcome::AlreadyInstalled(NamespaceState::Active));
    }
    if lifecycle.waiting.as_deref() == Some(namespace.as_str()) {
      self.bus.publish(ManagerMessage::NewVersionAvailable);
      return Ok(InstallOutcome::AlreadyInstalled(NamespaceState::Waiting));
    }

    info!(
      namespace = %namespace,
      resources = self.cache.manifest.len(),
      "Installing cache generation"
    );
    self
      .storage
      .create_namespace(&namespace, &self.cache.generation, NamespaceState::Installing)?;

    let entries = match self.fetch_manifest().await {
      Ok(entries) => entries,
      Err(e) => {
        warn!(namespace = %namespace, error = %e, "Install failed; discarding namespace");
        self.storage.delete_namespace(&namespace)?;
        return Err(e);
      }
    };

    // Manifest entries are pinned so the runtime caps never evict them
    for (key, snapshot) in &entries {
      if let Err(e) = self.storage.put_pinned(&namespace, key, snapshot) {
        self.storage.delete_namespace(&namespace)?;
        return Err(e);
      }
    }

    if lifecycle.active.is_none() {
      self.storage.set_namespace_state(&namespace, NamespaceState::Waiting)?;
      self.write_lifecycle(|l| l.waiting = Some(namespace.clone()))?;
      self.activate()?;
      return Ok(InstallOutcome::Activated);
    }

    // A previous waiting generation is replaced by this one
    if let Some(stale) = lifecycle.waiting {
      self.storage.delete_namespace(&stale)?;
    }
    self.storage.set_namespace_state(&namespace, NamespaceState::Waiting)?;
    self.write_lifecycle(|l| l.waiting = Some(namespace.clone()))?;
    info!(namespace = %namespace, "New cache generation waiting for activation");
    self.bus.publish(ManagerMessage::NewVersionAvailable);
    Ok(InstallOutcome::Waiting)
  }

  /// Fetch every manifest path concurrently.
  async fn fetch_manifest(&self) -> Result<Vec<(RequestKey, ResponseSnapshot)>> {
    let requests = self
      .cache
      .manifest
      .iter()
      .map(|path| self.upstream.resolve(path))
      .collect::<Result<Vec<_>>>()?;

    let responses = join_all(requests.iter().map(|url| {
      let request = OutboundRequest::get(url.clone());
      async move { self.upstream.fetch(&request).await }
    }))
    .await;

    let mut entries = Vec::with_capacity(responses.len());
    for (url, response) in requests.iter().zip(responses) {
      let mut snapshot =
        response.map_err(|e| eyre!("Failed to fetch manifest resource {}: {}", url, e))?;
      if !snapshot.is_success() {
        return Err(eyre!(
          "Manifest resource {} returned HTTP {}",
          url,
          snapshot.status
        ));
      }
      snapshot.retain_relevant_headers();
      entries.push((RequestKey::get(url), snapshot));
    }
    Ok(entries)
  }

  /// Cut over to the waiting generation and delete every other namespace.
  ///
  /// Requests already in flight keep the namespace they started with; every
  /// request after this call is served from the new one.
  pub fn activate(&self) -> Result<ActivateOutcome> {
    let namespace = self
      .read_lifecycle()?
      .waiting
      .ok_or_else(|| eyre!("No generation is waiting for activation"))?;

    self.storage.set_namespace_state(&namespace, NamespaceState::Active)?;
    self.write_lifecycle(|l| {
      l.active = Some(namespace.clone());
      l.waiting = None;
    })?;

    let mut removed = Vec::new();
    for other in self.storage.namespaces()? {
      if other.name == namespace {
        continue;
      }
      self
        .storage
        .set_namespace_state(&other.name, NamespaceState::Superseded)?;
      self.storage.delete_namespace(&other.name)?;
      removed.push(other.name);
    }

    info!(namespace = %namespace, removed = removed.len(), "Activated cache generation");
    Ok(ActivateOutcome { namespace, removed })
  }

  /// Activate the waiting generation if there is one.
  pub fn skip_waiting(&self) -> Result<Option<ActivateOutcome>> {
    if self.read_lifecycle()?.waiting.is_none() {
      return Ok(None);
    }
    self.activate().map(Some)
  }
}
