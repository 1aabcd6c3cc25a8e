use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::{EvictionPolicy, SqliteStorage, MAX_CACHE_AGE_MS, MAX_CACHE_SIZE};
use crate::router::{RoutingRules, CACHEABLE_EXTENSIONS};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Prefix of every namespace name (`<app_name>-cache-v<version>`)
  pub app_name: String,
  pub version: u32,
  /// Origin server the dashboard talks to
  pub origin: String,
  /// Paths pre-populated at install, in order
  pub app_shell: Vec<String>,
  pub max_cache_size: usize,
  pub max_cache_age_ms: i64,
  pub cacheable_extensions: Vec<String>,
  pub api_prefix: String,
  pub data_route_marker: String,
  pub soft_navigation_marker: String,
  /// Cache database location (defaults to the XDG data dir)
  pub database: Option<PathBuf>,
  pub request_timeout_secs: u64,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      app_name: "dashboard".to_string(),
      version: 1,
      origin: "http://localhost:8080".to_string(),
      app_shell: vec![
        "/".to_string(),
        "/manifest.json".to_string(),
        "/icons/icon-192.png".to_string(),
        "/icons/icon-512.png".to_string(),
      ],
      max_cache_size: MAX_CACHE_SIZE,
      max_cache_age_ms: MAX_CACHE_AGE_MS,
      cacheable_extensions: CACHEABLE_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
      api_prefix: "/api/".to_string(),
      data_route_marker: "/_next/data/".to_string(),
      soft_navigation_marker: "_rsc".to_string(),
      database: None,
      request_timeout_secs: 15,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shellcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shellcache/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found. Environment
  /// overrides are applied last.
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
      None => Self::default(),
    };

    config.with_env_overrides()
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("shellcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shellcache").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  /// Apply SHELLCACHE_ORIGIN and SHELLCACHE_VERSION if set.
  fn with_env_overrides(mut self) -> Result<Self> {
    if let Ok(origin) = std::env::var("SHELLCACHE_ORIGIN") {
      self.origin = origin;
    }
    if let Ok(version) = std::env::var("SHELLCACHE_VERSION") {
      self.version = version
        .parse()
        .map_err(|e| eyre!("Invalid SHELLCACHE_VERSION '{}': {}", version, e))?;
    }
    Ok(self)
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => SqliteStorage::default_path(),
    }
  }

  pub fn eviction_policy(&self) -> EvictionPolicy {
    EvictionPolicy {
      max_entries: self.max_cache_size,
      max_age: chrono::Duration::milliseconds(self.max_cache_age_ms),
    }
  }

  pub fn routing_rules(&self) -> Result<RoutingRules> {
    let mut rules = RoutingRules::new(self.origin_url()?, self.app_shell.clone());
    rules.api_prefix = self.api_prefix.clone();
    rules.data_route_marker = self.data_route_marker.clone();
    rules.soft_navigation_marker = self.soft_navigation_marker.clone();
    rules.cacheable_extensions = self
      .cacheable_extensions
      .iter()
      .map(|ext| ext.to_ascii_lowercase())
      .collect();
    Ok(rules)
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_match_cache_contract() {
    let config = Config::default();
    assert_eq!(config.max_cache_size, 50);
    assert_eq!(config.max_cache_age_ms, 604_800_000);
    assert_eq!(config.app_shell[0], "/");
    assert_eq!(config.cacheable_extensions.len(), 8);
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = Config::from_yaml(
      "app_name: admin\nversion: 4\norigin: https://admin.example\nmax_cache_size: 10\n",
    )
    .unwrap();
    assert_eq!(config.app_name, "admin");
    assert_eq!(config.version, 4);
    assert_eq!(config.max_cache_size, 10);
    assert_eq!(config.api_prefix, "/api/");
    assert_eq!(config.eviction_policy().max_entries, 10);
    assert_eq!(
      config.routing_rules().unwrap().origin.as_str(),
      "https://admin.example/"
    );
  }

  #[test]
  fn test_bad_origin_is_an_error() {
    let config = Config::from_yaml("origin: not a url\n").unwrap();
    assert!(config.routing_rules().is_err());
  }

  #[test]
  fn test_unknown_yaml_type_is_an_error() {
    assert!(Config::from_yaml("version: seven\n").is_err());
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    assert!(Config::load(Some(Path::new("/definitely/not/here.yaml"))).is_err());
  }
}
