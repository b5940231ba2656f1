use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable holding the API bearer token
pub const TOKEN_ENV: &str = "ECOFINDS_API_TOKEN";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub api: ApiConfig,
  pub cache: CacheConfig,
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  /// Base URL every endpoint path is appended to
  pub base_url: String,
  /// Per-request timeout; expiry is reported as a network error
  pub timeout_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:5000/api".to_string(),
      timeout_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Default freshness window for queries
  pub stale_time_secs: u64,
  /// Freshness window for catalog pages
  pub products_stale_time_secs: u64,
  /// How long unreferenced entries are kept
  pub gc_time_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_time_secs: 0,
      products_stale_time_secs: 5 * 60,
      gc_time_secs: 5 * 60,
    }
  }
}

impl CacheConfig {
  pub fn stale_time(&self) -> Duration {
    Duration::from_secs(self.stale_time_secs)
  }

  pub fn products_stale_time(&self) -> Duration {
    Duration::from_secs(self.products_stale_time_secs)
  }

  pub fn gc_time(&self) -> Duration {
    Duration::from_secs(self.gc_time_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Default filter directive; `RUST_LOG` takes precedence
  pub level: String,
  /// Log file; stderr when unset
  pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
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
  /// 2. ./ecofinds.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/ecofinds/config.yaml
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
    let local = PathBuf::from("ecofinds.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("ecofinds").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    // An empty file is valid and means all defaults
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Get the API token from the environment, if set.
  pub fn get_api_token() -> Option<String> {
    std::env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty())
  }
}
