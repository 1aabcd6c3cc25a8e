//! Request classification and network/cache orchestration.

use std::sync::Arc;

use reqwest::Method;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheKey, CacheSource, CacheStorage, EvictionEngine};
use crate::error::{Result, ShellCacheError};
use crate::fallback::offline_response;
use crate::net::{Network, Request, Response};

/// Extensions served network-first with cache fallback
pub const CACHEABLE_EXTENSIONS: &[&str] = &[
  ".js", ".css", ".woff", ".woff2", ".png", ".jpg", ".svg", ".ico",
];

/// Handling policy for an intercepted request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
  /// Straight to the origin, never cached
  NetworkOnly,
  /// Origin first; on success store, on failure serve from cache
  NetworkFirstWithCacheFallback,
}

/// Fixed rule set the classifier evaluates.
#[derive(Debug, Clone)]
pub struct RoutingRules {
  pub origin: Url,
  pub api_prefix: String,
  /// Path fragment identifying framework data routes
  pub data_route_marker: String,
  /// Query parameter name marking soft navigations
  pub soft_navigation_marker: String,
  pub cacheable_extensions: Vec<String>,
  pub app_shell: Vec<String>,
}

impl RoutingRules {
  pub fn new(origin: Url, app_shell: Vec<String>) -> Self {
    Self {
      origin,
      api_prefix: "/api/".to_string(),
      data_route_marker: "/_next/data/".to_string(),
      soft_navigation_marker: "_rsc".to_string(),
      cacheable_extensions: CACHEABLE_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
      app_shell,
    }
  }

  fn is_same_origin(&self, url: &Url) -> bool {
    url.origin() == self.origin.origin()
  }

  fn is_bypassed(&self, url: &Url) -> bool {
    let path = url.path();
    path.starts_with(&self.api_prefix)
      || path.contains(&self.data_route_marker)
      || url
        .query_pairs()
        .any(|(name, _)| name == self.soft_navigation_marker.as_str())
  }

  fn is_cacheable(&self, url: &Url) -> bool {
    let path = url.path();
    let lower = path.to_ascii_lowercase();
    self
      .cacheable_extensions
      .iter()
      .any(|ext| lower.ends_with(ext.as_str()))
      || self.app_shell.iter().any(|shell| shell == path)
  }

  /// Pure classification of a request against the rule set.
  pub fn classify(&self, request: &Request) -> Decision {
    if request.method != Method::GET || !self.is_same_origin(&request.url) {
      return Decision::NetworkOnly;
    }
    if self.is_bypassed(&request.url) {
      return Decision::NetworkOnly;
    }
    if self.is_cacheable(&request.url) {
      return Decision::NetworkFirstWithCacheFallback;
    }
    Decision::NetworkOnly
  }
}

/// A response plus where it came from.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: CacheSource,
  pub decision: Decision,
}

/// Result of intercepting one request.
///
/// `wait_until` holds cache work still running after the response is ready.
/// The host must await it before tearing down the runtime.
pub struct Intercepted {
  pub served: Served,
  pub wait_until: Vec<JoinHandle<()>>,
}

impl Intercepted {
  /// Wait for outstanding cache work, then hand back the response.
  pub async fn settle(self) -> Served {
    for handle in self.wait_until {
      if let Err(e) = handle.await {
        warn!("cache population task did not finish: {}", e);
      }
    }
    self.served
  }
}

/// Sits between the dashboard and the origin.
pub struct Router<S: CacheStorage, N: Network> {
  rules: Arc<RoutingRules>,
  storage: Arc<S>,
  network: Arc<N>,
  eviction: EvictionEngine<S>,
  active: watch::Receiver<Option<String>>,
}

impl<S, N> Router<S, N>
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  pub fn new(
    rules: RoutingRules,
    storage: Arc<S>,
    network: Arc<N>,
    eviction: EvictionEngine<S>,
    active: watch::Receiver<Option<String>>,
  ) -> Self {
    Self {
      rules: Arc::new(rules),
      storage,
      network,
      eviction,
      active,
    }
  }

  pub fn classify(&self, request: &Request) -> Decision {
    self.rules.classify(request)
  }

  /// Handle one request.
  ///
  /// Only `NetworkOnly` requests can fail, with the origin's own error, as if
  /// nothing had intercepted them.
  pub async fn handle(&self, request: &Request) -> Result<Intercepted> {
    let decision = self.classify(request);
    debug!(method = %request.method, url = %request.url, ?decision, "intercepted");

    match decision {
      Decision::NetworkOnly => {
        let response = self.network.fetch(request).await?;
        Ok(Intercepted {
          served: Served {
            response,
            source: CacheSource::Network,
            decision,
          },
          wait_until: Vec::new(),
        })
      }
      Decision::NetworkFirstWithCacheFallback => Ok(self.network_first(request, decision).await),
    }
  }

  async fn network_first(&self, request: &Request, decision: Decision) -> Intercepted {
    let key = CacheKey::for_request(request);
    let namespace = self.active.borrow().clone();

    match self.network.fetch(request).await {
      Ok(response) => {
        let mut wait_until = Vec::new();
        if response.is_ok() {
          if let Some(namespace) = namespace {
            wait_until.push(self.spawn_store(namespace, key, response.clone()));
          }
        }
        Intercepted {
          served: Served {
            response,
            source: CacheSource::Network,
            decision,
          },
          wait_until,
        }
      }
      Err(e) => {
        debug!(%key, "network failed, trying cache: {}", e);
        let served = match self.lookup(namespace.as_deref(), &key) {
          Some(response) => Served {
            response,
            source: CacheSource::Cache,
            decision,
          },
          None => {
            warn!(%key, "offline with no cached copy");
            Served {
              response: offline_response(),
              source: CacheSource::Offline,
              decision,
            }
          }
        };
        Intercepted {
          served,
          wait_until: Vec::new(),
        }
      }
    }
  }

  fn lookup(&self, namespace: Option<&str>, key: &CacheKey) -> Option<Response> {
    let namespace = namespace?;
    match self.storage.get(namespace, key) {
      Ok(entry) => entry.map(|e| e.response),
      Err(e) => {
        warn!(%key, namespace, "cache read failed: {:#}", e);
        None
      }
    }
  }

  /// Store a copy of the response and run the capacity check, off the
  /// response path. Failures are logged and swallowed.
  fn spawn_store(&self, namespace: String, key: CacheKey, response: Response) -> JoinHandle<()> {
    let storage = Arc::clone(&self.storage);
    let eviction = self.eviction.clone();

    tokio::spawn(async move {
      if let Err(e) = storage.put(&namespace, &key, &response) {
        let failure = ShellCacheError::CacheWriteFailure {
          key: key.to_string(),
          reason: format!("{:#}", e),
        };
        warn!(namespace = %namespace, "{}", failure);
        return;
      }
      debug!(%key, namespace = %namespace, "stored");

      if let Err(e) = eviction.enforce_capacity(&namespace).await {
        warn!(namespace = %namespace, "capacity check failed: {:#}", e);
      }
    })
  }
}

impl<S: CacheStorage, N: Network> Clone for Router<S, N> {
  fn clone(&self) -> Self {
    Self {
      rules: Arc::clone(&self.rules),
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      eviction: self.eviction.clone(),
      active: self.active.clone(),
    }
  }
}
