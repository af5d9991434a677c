use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use marketsync::api::RetryPolicy;
use marketsync::realtime::{ConnectionSettings, PoolSettings};
use marketsync::state::{Actor, Role};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub retry: RetryConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  /// Who mutations run as (defaults to a read-only viewer)
  #[serde(default = "anonymous_actor")]
  pub actor: Actor,
  pub realtime: Option<RealtimeConfig>,
}

fn anonymous_actor() -> Actor {
  Actor::new("anonymous", Role::Viewer)
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  pub base_url: String,
  #[serde(default = "default_collection")]
  pub collection: String,
  /// Per-attempt request timeout
  #[serde(default = "default_timeout_ms")]
  pub timeout_ms: u64,
  pub page_size: Option<u32>,
  /// Queue writes that fail to reach the server
  #[serde(default)]
  pub outbox: bool,
}

fn default_collection() -> String {
  "resources".to_string()
}

fn default_timeout_ms() -> u64 {
  10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
  #[serde(default = "default_max_attempts")]
  pub max_attempts: u32,
  #[serde(default = "default_base_delay_ms")]
  pub base_delay_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_attempts: default_max_attempts(),
      base_delay_ms: default_base_delay_ms(),
    }
  }
}

fn default_max_attempts() -> u32 {
  3
}

fn default_base_delay_ms() -> u64 {
  500
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Database file (default: $XDG_DATA_HOME/marketsync/cache.db)
  pub path: Option<PathBuf>,
  /// Keep the cache in memory only
  #[serde(default)]
  pub in_memory: bool,
  #[serde(default = "default_ttl_secs")]
  pub ttl_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      path: None,
      in_memory: false,
      ttl_secs: default_ttl_secs(),
    }
  }
}

fn default_ttl_secs() -> u64 {
  24 * 60 * 60
}

#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeConfig {
  pub url: String,
  #[serde(default = "default_max_connections")]
  pub max_connections: usize,
  #[serde(default = "default_idle_timeout_secs")]
  pub idle_timeout_secs: u64,
  #[serde(default = "default_heartbeat_interval_secs")]
  pub heartbeat_interval_secs: u64,
  #[serde(default = "default_heartbeat_timeout_secs")]
  pub heartbeat_timeout_secs: u64,
  #[serde(default = "default_max_reconnect_attempts")]
  pub max_reconnect_attempts: u32,
  #[serde(default = "default_ack_timeout_ms")]
  pub ack_timeout_ms: u64,
}

fn default_max_connections() -> usize {
  10
}

fn default_idle_timeout_secs() -> u64 {
  300
}

fn default_heartbeat_interval_secs() -> u64 {
  30
}

fn default_heartbeat_timeout_secs() -> u64 {
  10
}

fn default_max_reconnect_attempts() -> u32 {
  5
}

fn default_ack_timeout_ms() -> u64 {
  5_000
}

impl RealtimeConfig {
  pub fn connection_settings(&self, retry: &RetryConfig) -> ConnectionSettings {
    ConnectionSettings {
      heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
      heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
      max_reconnect_attempts: self.max_reconnect_attempts,
      reconnect_base_delay: Duration::from_millis(retry.base_delay_ms),
      ..ConnectionSettings::default()
    }
  }

  pub fn pool_settings(&self) -> PoolSettings {
    PoolSettings {
      max_connections: self.max_connections,
      idle_timeout: Duration::from_secs(self.idle_timeout_secs),
      ..PoolSettings::default()
    }
  }

  pub fn ack_timeout(&self) -> Duration {
    Duration::from_millis(self.ack_timeout_ms)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./marketsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/marketsync/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/marketsync/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("marketsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("marketsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.retry.max_attempts == 0 {
      return Err(eyre!("retry.max_attempts must be at least 1"));
    }
    Ok(config)
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_attempts: self.retry.max_attempts,
      base_delay: Duration::from_millis(self.retry.base_delay_ms),
      timeout: Duration::from_millis(self.api.timeout_ms),
    }
  }

  /// Get the API token from environment variables.
  ///
  /// Checks MARKETSYNC_API_TOKEN first, then MARKET_API_TOKEN as fallback.
  /// The API may be public, so a missing token is not an error.
  pub fn get_api_token() -> Option<String> {
    std::env::var("MARKETSYNC_API_TOKEN")
      .or_else(|_| std::env::var("MARKET_API_TOKEN"))
      .ok()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_gets_defaults() {
    let config = Config::parse("api:\n  base_url: https://market.example.com/api\n").unwrap();

    assert_eq!(config.api.collection, "resources");
    assert!(!config.api.outbox);
    assert_eq!(config.actor, anonymous_actor());
    assert!(config.realtime.is_none());
    assert_eq!(
      config.retry_policy(),
      RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(500),
        timeout: Duration::from_secs(10),
      }
    );
  }

  #[test]
  fn test_full_config() {
    let config = Config::parse(
      r#"
api:
  base_url: https://market.example.com/api
  collection: templates
  timeout_ms: 2000
  page_size: 50
  outbox: true
retry:
  max_attempts: 5
  base_delay_ms: 100
cache:
  in_memory: true
  ttl_secs: 60
actor:
  id: u-42
  role: reviewer
realtime:
  url: wss://market.example.com/realtime
  max_connections: 3
"#,
    )
    .unwrap();

    assert_eq!(config.api.page_size, Some(50));
    assert!(config.cache.in_memory);
    assert_eq!(config.actor, Actor::new("u-42", Role::Reviewer));

    let realtime = config.realtime.unwrap();
    assert_eq!(realtime.pool_settings().max_connections, 3);
    let settings = realtime.connection_settings(&config.retry);
    assert_eq!(settings.reconnect_base_delay, Duration::from_millis(100));
    assert_eq!(settings.heartbeat_interval, Duration::from_secs(30));
  }

  #[test]
  fn test_rejects_zero_attempts() {
    let err = Config::parse("api:\n  base_url: http://x\nretry:\n  max_attempts: 0\n").unwrap_err();
    assert!(err.to_string().contains("max_attempts"));
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let err = Config::load(Some(Path::new("/nonexistent/marketsync.yaml"))).unwrap_err();
    assert!(err.to_string().contains("not found"));
  }
}
