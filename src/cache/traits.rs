//! Core types for the response cache.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::net::{Request, Response};

/// Canonical request identity: `METHOD URL` with the fragment stripped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
  pub fn for_request(request: &Request) -> Self {
    let mut url = request.url.clone();
    url.set_fragment(None);
    Self(format!("{} {}", request.method, url))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// SHA256 of the key, used as a fixed-length storage id
  pub fn hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.0.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl From<String> for CacheKey {
  fn from(s: String) -> Self {
    Self(s)
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Versioned namespace identity, rendered as `<app-name>-cache-v<N>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamespaceId {
  pub app: String,
  pub version: u32,
}

impl NamespaceId {
  pub fn new(app: impl Into<String>, version: u32) -> Self {
    Self {
      app: app.into(),
      version,
    }
  }

  pub fn name(&self) -> String {
    format!("{}-cache-v{}", self.app, self.version)
  }
}

impl fmt::Display for NamespaceId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}-cache-v{}", self.app, self.version)
  }
}

/// Lifecycle of a namespace.
///
/// `Installing -> Waiting -> Activating -> Active -> Superseded`. A failed
/// install drops back to `Uninstalled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  Uninstalled,
  Installing,
  Waiting,
  Activating,
  Active,
  Superseded,
}

impl LifecycleState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Uninstalled => "uninstalled",
      Self::Installing => "installing",
      Self::Waiting => "waiting",
      Self::Activating => "activating",
      Self::Active => "active",
      Self::Superseded => "superseded",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "uninstalled" => Some(Self::Uninstalled),
      "installing" => Some(Self::Installing),
      "waiting" => Some(Self::Waiting),
      "activating" => Some(Self::Activating),
      "active" => Some(Self::Active),
      "superseded" => Some(Self::Superseded),
      _ => None,
    }
  }

  /// Whether `self -> next` is a legal lifecycle step
  pub fn can_transition_to(&self, next: LifecycleState) -> bool {
    use LifecycleState::*;
    matches!(
      (self, next),
      (Uninstalled, Installing)
        | (Installing, Waiting)
        | (Installing, Uninstalled)
        | (Waiting, Activating)
        | (Waiting, Installing)
        | (Activating, Active)
        | (Activating, Waiting)
        | (Active, Superseded)
    )
  }
}

impl fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(self.as_str())
  }
}

/// A namespace as persisted by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceInfo {
  pub name: String,
  pub state: LifecycleState,
  pub entry_count: usize,
}

/// A stored entry plus the metadata eviction needs
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: Response,
  /// Insertion sequence number; lower is older
  pub seq: i64,
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Live response from the origin
  Network,
  /// Network failed, served from the active namespace
  Cache,
  /// Network and cache both failed, synthesized offline page
  Offline,
}

impl fmt::Display for CacheSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Offline => "offline",
    };
    f.write_str(s)
  }
}
