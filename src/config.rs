use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{EntityKind, TtlPolicy};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub store: StoreConfig,
  #[serde(default)]
  pub paging: PagingConfig,
  /// Write logs to this file instead of stderr
  pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// TTL for keys outside the entity registry
  pub default_ttl_ms: u64,
  /// Upper bound on stored entries; the least recently used is evicted
  pub max_entries: usize,
  /// Fraction of an entry's TTL after which it is served stale and refreshed
  /// in the background. 1.0 disables stale-while-revalidate.
  pub stale_ratio: f64,
  /// How often the maintenance task sweeps expired entries
  pub cleanup_interval_ms: u64,
  /// Per-entity TTL overrides
  pub ttl_ms: BTreeMap<EntityKind, u64>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      default_ttl_ms: 5 * 60 * 1000,
      max_entries: 1000,
      stale_ratio: 0.8,
      cleanup_interval_ms: 5 * 60 * 1000,
      ttl_ms: BTreeMap::new(),
    }
  }
}

impl CacheConfig {
  pub fn cleanup_interval(&self) -> Duration {
    Duration::from_millis(self.cleanup_interval_ms)
  }

  /// Build the TTL policy: the built-in table, then config overrides.
  pub fn policy(&self) -> TtlPolicy {
    let mut policy = TtlPolicy::default().with_default(Duration::from_millis(self.default_ttl_ms));
    for (kind, ms) in &self.ttl_ms {
      policy = policy.with_kind(*kind, Duration::from_millis(*ms));
    }
    policy
  }

  pub fn validate(&self) -> Result<()> {
    if !(self.stale_ratio > 0.0 && self.stale_ratio <= 1.0) {
      return Err(eyre!(
        "cache.stale_ratio must be in (0, 1], got {}",
        self.stale_ratio
      ));
    }
    if self.max_entries == 0 {
      return Err(eyre!("cache.max_entries must be at least 1"));
    }
    if self.cleanup_interval_ms == 0 {
      return Err(eyre!("cache.cleanup_interval_ms must be positive"));
    }
    Ok(())
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
  /// SQLite database path (default: $XDG_DATA_HOME/trackcache/documents.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PagingConfig {
  pub page_size: usize,
}

impl Default for PagingConfig {
  fn default() -> Self {
    Self { page_size: 20 }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./trackcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/trackcache/config.yaml
  ///
  /// With no file anywhere the defaults are used.
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };
    config.cache.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("trackcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("trackcache").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Resolve the SQLite path, falling back to the data directory.
  pub fn store_path(&self) -> Result<PathBuf> {
    if let Some(p) = &self.store.path {
      return Ok(p.clone());
    }
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("trackcache").join("documents.db"))
  }
}
