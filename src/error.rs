use thiserror::Error;

/// Failure kinds raised by the interception and caching layer.
///
/// Only `InstallFailure` and `ActivationFailure` ever reach a caller; the
/// rest are recovered or logged where they happen.
#[derive(Error, Debug)]
pub enum ShellCacheError {
  #[error("Install of {namespace} failed: {reason}")]
  InstallFailure { namespace: String, reason: String },

  #[error("Activation of {namespace} failed: {reason}")]
  ActivationFailure { namespace: String, reason: String },

  #[error("Network error: {0}")]
  NetworkFailure(String),

  #[error("Cache write failed for {key}: {reason}")]
  CacheWriteFailure { key: String, reason: String },

  #[error("Maintenance failed: {0}")]
  MaintenanceFailure(String),

  #[error("Invalid lifecycle transition from {current} to {requested}")]
  InvalidTransition {
    current: &'static str,
    requested: &'static str,
  },

  #[error("Storage error: {0}")]
  Storage(String),
}

impl From<color_eyre::Report> for ShellCacheError {
  fn from(e: color_eyre::Report) -> Self {
    ShellCacheError::Storage(format!("{:#}", e))
  }
}

impl From<reqwest::Error> for ShellCacheError {
  fn from(e: reqwest::Error) -> Self {
    ShellCacheError::NetworkFailure(e.to_string())
  }
}

pub type Result<T, E = ShellCacheError> = std::result::Result<T, E>;
