//! Versioned namespace lifecycle: install, take over, activate, purge.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use url::Url;

use super::eviction::EvictionEngine;
use super::storage::CacheStorage;
use super::traits::{CacheKey, LifecycleState, NamespaceId};
use crate::error::{Result, ShellCacheError};
use crate::net::{Network, Request, Response};

/// Owns the namespace for the running version and decides which namespace
/// the router serves from.
pub struct NamespaceManager<S: CacheStorage> {
  storage: Arc<S>,
  current: NamespaceId,
  origin: Url,
  app_shell: Vec<String>,
  eviction: EvictionEngine<S>,
  state: Mutex<LifecycleState>,
  /// Name of the namespace currently serving traffic
  active_tx: watch::Sender<Option<String>>,
}

impl<S: CacheStorage> NamespaceManager<S> {
  /// Create a manager for `current`, picking up whatever the store already
  /// holds. An existing active namespace keeps serving until this version
  /// activates.
  pub fn new(
    storage: Arc<S>,
    current: NamespaceId,
    origin: Url,
    app_shell: Vec<String>,
    eviction: EvictionEngine<S>,
  ) -> Result<Self> {
    let namespaces = storage.list_namespaces()?;
    let current_name = current.name();

    let serving = namespaces
      .iter()
      .find(|ns| ns.state == LifecycleState::Active)
      .map(|ns| ns.name.clone());

    let state = match namespaces.iter().find(|ns| ns.name == current_name) {
      Some(ns) if ns.state == LifecycleState::Active => LifecycleState::Active,
      Some(ns) if ns.state == LifecycleState::Waiting => LifecycleState::Waiting,
      _ => LifecycleState::Uninstalled,
    };

    debug!(current = %current, %state, serving = ?serving, "namespace manager ready");

    let (active_tx, _) = watch::channel(serving);

    Ok(Self {
      storage,
      current,
      origin,
      app_shell,
      eviction,
      state: Mutex::new(state),
      active_tx,
    })
  }

  pub fn current(&self) -> &NamespaceId {
    &self.current
  }

  pub fn state(&self) -> LifecycleState {
    *self.lock_state()
  }

  /// Namespace the router should read from and write to, if any
  pub fn active_namespace(&self) -> Option<String> {
    self.active_tx.borrow().clone()
  }

  /// Watch for changes to the serving namespace
  pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
    self.active_tx.subscribe()
  }

  fn lock_state(&self) -> MutexGuard<'_, LifecycleState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn transition(&self, next: LifecycleState) -> Result<()> {
    let mut state = self.lock_state();
    if !state.can_transition_to(next) {
      return Err(ShellCacheError::InvalidTransition {
        current: state.as_str(),
        requested: next.as_str(),
      });
    }
    debug!(namespace = %self.current, from = %*state, to = %next, "lifecycle transition");
    *state = next;
    Ok(())
  }

  /// Open the namespace for the current version and pre-populate the app
  /// shell.
  ///
  /// All-or-nothing: if any shell resource fails, nothing is written, a
  /// namespace created by this call is dropped again, and the previously
  /// active namespace keeps serving.
  pub async fn install<N: Network + ?Sized>(&self, network: &N) -> Result<()> {
    if self.state() == LifecycleState::Active {
      debug!(namespace = %self.current, "already active, skipping install");
      return Ok(());
    }

    self.transition(LifecycleState::Installing)?;
    let name = self.current.name();

    let outcome = match self.storage.open_namespace(&name, LifecycleState::Installing) {
      Ok(created) => match self.populate(network, &name).await {
        Ok(()) => self
          .storage
          .set_namespace_state(&name, LifecycleState::Waiting)
          .map_err(|e| (created, format!("{:#}", e))),
        Err(reason) => Err((created, reason)),
      },
      Err(e) => Err((false, format!("{:#}", e))),
    };

    match outcome {
      Ok(()) => {
        self.transition(LifecycleState::Waiting)?;
        info!(namespace = %name, resources = self.app_shell.len(), "install complete");
        Ok(())
      }
      Err((created, reason)) => {
        if created {
          if let Err(e) = self.storage.delete_namespace(&name) {
            warn!(namespace = %name, "failed to drop partial namespace: {:#}", e);
          }
        }
        self.transition(LifecycleState::Uninstalled)?;
        error!(namespace = %name, %reason, "install failed");
        Err(ShellCacheError::InstallFailure {
          namespace: name,
          reason,
        })
      }
    }
  }

  /// Fetch every shell resource, then store them all.
  async fn populate<N: Network + ?Sized>(
    &self,
    network: &N,
    name: &str,
  ) -> std::result::Result<(), String> {
    let mut fetched: Vec<(CacheKey, Response)> = Vec::with_capacity(self.app_shell.len());

    for path in &self.app_shell {
      let url = self
        .origin
        .join(path)
        .map_err(|e| format!("invalid shell path {}: {}", path, e))?;
      let request = Request::get(url);

      let response = network
        .fetch(&request)
        .await
        .map_err(|e| format!("{}: {}", path, e))?;
      if !response.is_ok() {
        return Err(format!("{}: status {}", path, response.status));
      }

      fetched.push((CacheKey::for_request(&request), response));
    }

    for (key, response) in &fetched {
      self
        .storage
        .put(name, key, response)
        .map_err(|e| format!("{}: {:#}", key, e))?;
    }

    Ok(())
  }

  /// Take over immediately instead of waiting for old clients to go away.
  pub fn skip_waiting(&self) -> Result<()> {
    self.transition(LifecycleState::Activating)
  }

  /// Purge every other namespace, sweep expired entries, then start serving
  /// from the current namespace.
  pub async fn activate(&self) -> Result<()> {
    if self.state() != LifecycleState::Activating {
      return Err(ShellCacheError::InvalidTransition {
        current: self.state().as_str(),
        requested: LifecycleState::Active.as_str(),
      });
    }

    let name = self.current.name();
    if let Err(reason) = self.purge_others(&name) {
      // Back to waiting; the next activation attempt retries the purge
      self.transition(LifecycleState::Waiting)?;
      error!(namespace = %name, %reason, "activation failed");
      return Err(ShellCacheError::ActivationFailure {
        namespace: name,
        reason,
      });
    }

    if let Err(e) = self.storage.set_namespace_state(&name, LifecycleState::Active) {
      self.transition(LifecycleState::Waiting)?;
      error!(namespace = %name, "activation failed: {:#}", e);
      return Err(ShellCacheError::ActivationFailure {
        namespace: name,
        reason: format!("{:#}", e),
      });
    }

    if let Err(e) = self.eviction.sweep_expired(&name, Utc::now()).await {
      warn!(namespace = %name, "age sweep during activation failed: {:#}", e);
    }

    self.transition(LifecycleState::Active)?;
    self.active_tx.send_replace(Some(name.clone()));
    info!(namespace = %name, "activated");
    Ok(())
  }

  fn purge_others(&self, keep: &str) -> std::result::Result<(), String> {
    let namespaces = self
      .storage
      .list_namespaces()
      .map_err(|e| format!("{:#}", e))?;

    for ns in namespaces.into_iter().filter(|ns| ns.name != keep) {
      if ns.state == LifecycleState::Active {
        if let Err(e) = self
          .storage
          .set_namespace_state(&ns.name, LifecycleState::Superseded)
        {
          warn!(namespace = %ns.name, "failed to mark superseded: {:#}", e);
        }
        info!(namespace = %ns.name, by = keep, "superseded");
      }

      self
        .storage
        .delete_namespace(&ns.name)
        .map_err(|e| format!("deleting {}: {:#}", ns.name, e))?;
      debug!(namespace = %ns.name, entries = ns.entry_count, "purged namespace");
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::eviction::EvictionPolicy;
  use crate::cache::storage::{MemoryStorage, SqliteStorage};
  use crate::net::stub::StubNetwork;
  use chrono::Duration;

  const SHELL: [&str; 4] = [
    "/",
    "/manifest.json",
    "/icons/icon-192.png",
    "/icons/icon-512.png",
  ];

  fn origin() -> Url {
    Url::parse("https://dash.example").unwrap()
  }

  fn shell_network() -> StubNetwork {
    SHELL
      .iter()
      .fold(StubNetwork::new(), |net, path| net.ok(path, path, None))
  }

  fn manager<S: CacheStorage>(storage: Arc<S>, version: u32) -> NamespaceManager<S> {
    let eviction = EvictionEngine::new(storage.clone(), EvictionPolicy::default());
    NamespaceManager::new(
      storage,
      NamespaceId::new("dashboard", version),
      origin(),
      SHELL.iter().map(|s| s.to_string()).collect(),
      eviction,
    )
    .unwrap()
  }

  async fn bring_up<S: CacheStorage>(manager: &NamespaceManager<S>, network: &StubNetwork) {
    manager.install(network).await.unwrap();
    manager.skip_waiting().unwrap();
    manager.activate().await.unwrap();
  }

  fn shell_key(path: &str) -> CacheKey {
    CacheKey::for_request(&Request::get(origin().join(path).unwrap()))
  }

  #[tokio::test]
  async fn test_install_populates_every_shell_path() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let manager = manager(storage.clone(), 1);

    manager.install(&shell_network()).await.unwrap();

    assert_eq!(manager.state(), LifecycleState::Waiting);
    for path in SHELL {
      assert!(
        storage.get("dashboard-cache-v1", &shell_key(path)).unwrap().is_some(),
        "missing {}",
        path
      );
    }
    // Not serving until activation
    assert_eq!(manager.active_namespace(), None);
  }

  #[tokio::test]
  async fn test_install_failure_is_all_or_nothing() {
    let storage = Arc::new(MemoryStorage::new());
    let network = shell_network();
    network.go_offline("/manifest.json");
    let manager = manager(storage.clone(), 1);

    let err = manager.install(&network).await.unwrap_err();
    assert!(matches!(err, ShellCacheError::InstallFailure { .. }));
    assert_eq!(manager.state(), LifecycleState::Uninstalled);
    assert!(storage.list_namespaces().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_install_rejects_non_ok_shell_response() {
    let storage = Arc::new(MemoryStorage::new());
    let network = shell_network().reply(
      "/",
      Response::new(404, Default::default(), b"missing".to_vec()),
    );
    let manager = manager(storage.clone(), 1);

    assert!(manager.install(&network).await.is_err());
    assert!(storage.list_namespaces().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_failed_install_keeps_previous_namespace_serving() {
    let storage = Arc::new(MemoryStorage::new());
    let network = shell_network();
    let v1 = manager(storage.clone(), 1);
    bring_up(&v1, &network).await;

    network.go_offline("/icons/icon-512.png");
    let v2 = manager(storage.clone(), 2);
    assert_eq!(v2.active_namespace().as_deref(), Some("dashboard-cache-v1"));
    assert!(v2.install(&network).await.is_err());

    assert_eq!(v2.active_namespace().as_deref(), Some("dashboard-cache-v1"));
    let names: Vec<String> = storage
      .list_namespaces()
      .unwrap()
      .into_iter()
      .map(|ns| ns.name)
      .collect();
    assert_eq!(names, vec!["dashboard-cache-v1".to_string()]);
  }

  #[tokio::test]
  async fn test_activate_purges_every_other_namespace() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = shell_network();
    bring_up(&manager(storage.clone(), 1), &network).await;
    storage
      .open_namespace("leftover-cache-v9", LifecycleState::Installing)
      .unwrap();

    let v2 = manager(storage.clone(), 2);
    bring_up(&v2, &network).await;

    let namespaces = storage.list_namespaces().unwrap();
    assert_eq!(namespaces.len(), 1);
    assert_eq!(namespaces[0].name, "dashboard-cache-v2");
    assert_eq!(namespaces[0].state, LifecycleState::Active);
    assert_eq!(v2.state(), LifecycleState::Active);
    assert_eq!(v2.active_namespace().as_deref(), Some("dashboard-cache-v2"));
  }

  #[tokio::test]
  async fn test_activate_sweeps_expired_entries() {
    let storage = Arc::new(MemoryStorage::new());
    let old = (Utc::now() - Duration::days(8)).to_rfc2822();
    let network = SHELL.iter().fold(StubNetwork::new(), |net, path| {
      let date = if *path == "/manifest.json" {
        Some(old.as_str())
      } else {
        None
      };
      net.ok(path, path, date)
    });

    let manager = manager(storage.clone(), 1);
    bring_up(&manager, &network).await;

    assert!(storage
      .get("dashboard-cache-v1", &shell_key("/manifest.json"))
      .unwrap()
      .is_none());
    assert!(storage
      .get("dashboard-cache-v1", &shell_key("/"))
      .unwrap()
      .is_some());
  }

  #[tokio::test]
  async fn test_activate_requires_take_over_signal() {
    let storage = Arc::new(MemoryStorage::new());
    let manager = manager(storage, 1);
    manager.install(&shell_network()).await.unwrap();

    let err = manager.activate().await.unwrap_err();
    assert!(matches!(err, ShellCacheError::InvalidTransition { .. }));
    assert_eq!(manager.state(), LifecycleState::Waiting);
  }

  #[tokio::test]
  async fn test_skip_waiting_before_install_is_rejected() {
    let manager = manager(Arc::new(MemoryStorage::new()), 1);
    assert!(manager.skip_waiting().is_err());
    assert_eq!(manager.state(), LifecycleState::Uninstalled);
  }

  #[tokio::test]
  async fn test_reinstall_of_active_version_is_a_no_op() {
    let storage = Arc::new(MemoryStorage::new());
    let network = shell_network();
    let manager = manager(storage, 1);
    bring_up(&manager, &network).await;

    network.go_offline_all();
    manager.install(&network).await.unwrap();
    assert_eq!(manager.state(), LifecycleState::Active);
    assert!(network.calls().len() == SHELL.len());
  }

  #[tokio::test]
  async fn test_new_manager_resumes_persisted_state() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    bring_up(&manager(storage.clone(), 3), &shell_network()).await;

    let resumed = manager(storage, 3);
    assert_eq!(resumed.state(), LifecycleState::Active);
    assert_eq!(
      resumed.active_namespace().as_deref(),
      Some("dashboard-cache-v3")
    );
  }

  #[tokio::test]
  async fn test_subscribers_see_activation() {
    let storage = Arc::new(MemoryStorage::new());
    let manager = manager(storage, 1);
    let mut rx = manager.subscribe();
    assert_eq!(*rx.borrow(), None);

    bring_up(&manager, &shell_network()).await;
    assert!(rx.has_changed().unwrap());
    assert_eq!(
      rx.borrow_and_update().as_deref(),
      Some("dashboard-cache-v1")
    );
  }
}
