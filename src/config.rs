use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::db::Database;
use crate::worker::WorkerDefinition;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Base URL relative asset paths and requests resolve against
  pub origin: String,
  /// Registration scope
  pub scope: String,
  /// The worker definition to register
  pub worker: WorkerDefinition,
  pub updates: UpdatesConfig,
  pub cache: CacheConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:8000".to_string(),
      scope: "/".to_string(),
      worker: WorkerDefinition::default(),
      updates: UpdatesConfig::default(),
      cache: CacheConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpdatesConfig {
  /// Seconds between update checks in watch mode
  pub interval_secs: u64,
}

impl Default for UpdatesConfig {
  fn default() -> Self {
    Self { interval_secs: 60 }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Cache database (defaults to $XDG_DATA_HOME/gestto-sw/cache.db)
  pub path: Option<PathBuf>,
  /// Do not cache `no-store`/`private`/`Vary: *` responses
  pub respect_no_store: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      path: None,
      respect_no_store: true,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./gestto-sw.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/gestto-sw/config.yaml
  ///
  /// Falls back to the built-in defaults when no file is found.
  /// `GESTTO_SW_ORIGIN` overrides the configured origin.
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => {
        debug!("No configuration file found, using defaults");
        Self::default()
      }
    };

    if let Some(origin) = Self::get_origin_override() {
      config.origin = origin;
    }

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("gestto-sw.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("gestto-sw").join("config.yaml");
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

  /// Origin override from the environment.
  ///
  /// Checks GESTTO_SW_ORIGIN.
  fn get_origin_override() -> Option<String> {
    std::env::var("GESTTO_SW_ORIGIN")
      .ok()
      .filter(|s| !s.trim().is_empty())
  }

  fn validate(&self) -> Result<()> {
    self.origin_url()?;
    if self.worker.version.trim().is_empty() {
      return Err(eyre!("worker.version must not be empty"));
    }
    if self.updates.interval_secs == 0 {
      return Err(eyre!("updates.interval_secs must be at least 1"));
    }
    Ok(())
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin {}: {}", self.origin, e))
  }

  pub fn update_interval(&self) -> Duration {
    Duration::from_secs(self.updates.interval_secs)
  }

  /// Where the cache database lives.
  pub fn cache_path(&self) -> Result<PathBuf> {
    match &self.cache.path {
      Some(path) => Ok(path.clone()),
      None => Database::default_path(),
    }
  }
}
