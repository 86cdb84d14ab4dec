use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::sync::RetryPolicy;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub upstream: UpstreamConfig,
  pub proxy: ProxyConfig,
  pub cache: CacheConfig,
  pub sync: SyncConfig,
  pub connectivity: ConnectivityConfig,
  /// Directory holding state.db (defaults to the platform data directory)
  pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
  /// Origin of the POS backend; requests with this origin are same-origin
  pub url: String,
  /// Per-request timeout for proxied reads and writes
  pub timeout_secs: Option<u64>,
}

impl Default for UpstreamConfig {
  fn default() -> Self {
    Self {
      url: "http://127.0.0.1:3000".to_string(),
      timeout_secs: Some(30),
    }
  }
}

impl UpstreamConfig {
  pub fn origin(&self) -> Result<Url> {
    Url::parse(&self.url).map_err(|e| eyre!("Invalid upstream url '{}': {}", self.url, e))
  }

  pub fn timeout(&self) -> Option<Duration> {
    self.timeout_secs.map(Duration::from_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
  pub listen: String,
  /// Path prefix reserved for the backend REST API
  pub api_prefix: String,
  /// Local-only maintenance command (prune)
  pub maintenance_path: String,
  /// Local-only prefix for the message protocol
  pub control_prefix: String,
  /// Cached document served to navigations when offline
  pub shell_path: String,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      listen: "127.0.0.1:8787".to_string(),
      api_prefix: "/api/".to_string(),
      maintenance_path: "/__pos-sync/prune".to_string(),
      control_prefix: "/__pos-sync".to_string(),
      shell_path: "/index.html".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Namespace name prefix; the namespace is `{prefix}-{generation}`
  pub prefix: String,
  /// Tag of the deployed build
  pub generation: String,
  /// Entry cap applied after caching an API read
  pub api_max_entries: usize,
  /// Entry cap applied after caching a static asset
  pub static_max_entries: usize,
  /// Paths pre-loaded on install
  pub manifest: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: "pos-cache".to_string(),
      generation: env!("CARGO_PKG_VERSION").to_string(),
      api_max_entries: 300,
      static_max_entries: 400,
      manifest: [
        "/",
        "/index.html",
        "/manifest.json",
        "/icons/icon-192.png",
        "/icons/icon-512.png",
        "/offline-data.json",
        "/orders",
        "/inventory",
        "/finance",
        "/purchases",
        "/users",
        "/tables",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
    }
  }
}

impl CacheConfig {
  pub fn namespace(&self) -> String {
    format!("{}-{}", self.prefix, self.generation)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Batch reconciliation endpoint on the upstream
  pub endpoint: String,
  /// Unset means the batch request never times out
  pub batch_timeout_secs: Option<u64>,
  /// Request headers persisted with each outbox item
  pub forwarded_headers: Vec<String>,
  pub retry: RetryConfig,
  /// Dead-letter items rejected this many times (unset: never)
  pub item_max_attempts: Option<u32>,
  /// Dead-letter items older than this (unset: never)
  pub item_max_age_secs: Option<u64>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      endpoint: "/api/sync/batch".to_string(),
      batch_timeout_secs: None,
      forwarded_headers: vec!["authorization".to_string(), "content-type".to_string()],
      retry: RetryConfig::default(),
      item_max_attempts: None,
      item_max_age_secs: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub max_retries: u32,
  pub initial_delay_ms: u64,
  pub max_delay_ms: u64,
  pub jitter_factor: f64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    let policy = RetryPolicy::default();
    Self {
      max_retries: policy.max_retries,
      initial_delay_ms: policy.initial_delay.as_millis() as u64,
      max_delay_ms: policy.max_delay.as_millis() as u64,
      jitter_factor: policy.jitter_factor,
    }
  }
}

impl RetryConfig {
  pub fn policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_retries: self.max_retries,
      initial_delay: Duration::from_millis(self.initial_delay_ms),
      max_delay: Duration::from_millis(self.max_delay_ms),
      jitter_factor: self.jitter_factor.clamp(0.0, 1.0),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  /// Upstream path probed to detect connectivity (unset disables probing)
  pub probe_path: Option<String>,
  pub probe_interval_secs: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_path: Some("/api/health".to_string()),
      probe_interval_secs: 10,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./pos-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/pos-sync/config.yaml
  ///
  /// With no file found the defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("pos-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("pos-sync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    // An empty document deserializes to unit, not an empty map
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Get the backend token from the environment, if any.
  ///
  /// Used for the `Authorization` header of CLI-initiated flushes.
  pub fn get_api_token() -> Option<String> {
    std::env::var("POS_SYNC_TOKEN").ok()
  }
}
