use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::StoreConfig;
use crate::market::{demo_catalog, Product};

/// Environment variable that overrides `market.user_id`.
pub const USER_ID_ENV: &str = "QCACHE_USER_ID";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub cache: CacheConfig,
  pub market: MarketConfig,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// How long a fetched value counts as fresh
  pub stale_time_secs: u64,
  /// How long an unobserved entry survives before eviction
  pub gc_time_secs: u64,
  /// Interval of the background eviction sweep
  pub gc_interval_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_time_secs: 300,
      gc_time_secs: 300,
      gc_interval_secs: 60,
    }
  }
}

impl CacheConfig {
  pub fn store_config(&self) -> Result<StoreConfig> {
    let stale_time = i64::try_from(self.stale_time_secs)
      .ok()
      .and_then(chrono::Duration::try_seconds)
      .ok_or_else(|| {
        eyre!(
          "cache.stale_time_secs is out of range: {}",
          self.stale_time_secs
        )
      })?;
    Ok(StoreConfig {
      stale_time,
      gc_time: Duration::from_secs(self.gc_time_secs),
    })
  }

  pub fn gc_interval(&self) -> Duration {
    Duration::from_secs(self.gc_interval_secs.max(1))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
  /// Signed-in user. Anonymous viewers can browse but not like.
  pub user_id: Option<String>,
  /// Simulated backend round-trip
  pub latency_ms: u64,
  /// Seed listings (defaults to a small demo catalog)
  pub products: Vec<Product>,
}

impl Default for MarketConfig {
  fn default() -> Self {
    Self {
      user_id: None,
      latency_ms: 120,
      products: demo_catalog(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Default filter when QCACHE_LOG is unset
  pub level: String,
  /// Write logs here instead of stderr
  pub file: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./qcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/qcache/config.yaml
  ///
  /// Falls back to defaults when no file is found.
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
    let local = PathBuf::from("qcache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("qcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// The viewer id, with QCACHE_USER_ID taking precedence over the file.
  pub fn user_id(&self) -> Option<String> {
    self.user_id_or(std::env::var(USER_ID_ENV).ok())
  }

  fn user_id_or(&self, env_value: Option<String>) -> Option<String> {
    env_value
      .filter(|id| !id.trim().is_empty())
      .or_else(|| self.market.user_id.clone())
  }
}
