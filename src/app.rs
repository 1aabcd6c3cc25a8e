use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use url::Url;

use crate::cache::{
  CacheStorage, EvictionEngine, LifecycleState, NamespaceId, NamespaceInfo, NamespaceManager,
  SqliteStorage,
};
use crate::config::Config;
use crate::event::{Dispatcher, Event, EventOutcome};
use crate::maintenance::MaintenanceHandle;
use crate::net::{HttpNetwork, Request};
use crate::router::{Router, Served};

/// Snapshot of the cache state for display
pub struct Status {
  pub current: NamespaceId,
  pub state: LifecycleState,
  pub serving: Option<String>,
  pub namespaces: Vec<NamespaceInfo>,
}

/// Wires storage, network, lifecycle and routing together and plays the
/// host runtime for them.
pub struct App {
  origin: Url,
  storage: Arc<SqliteStorage>,
  manager: Arc<NamespaceManager<SqliteStorage>>,
  maintenance: MaintenanceHandle,
  maintenance_task: JoinHandle<()>,
  dispatcher: Dispatcher,
}

impl App {
  pub async fn new(config: Config) -> Result<Self> {
    let origin = config.origin_url()?;
    let storage = Arc::new(SqliteStorage::open(&config.database_path()?)?);
    let network = Arc::new(HttpNetwork::new(config.request_timeout())?);
    let eviction = EvictionEngine::new(Arc::clone(&storage), config.eviction_policy());

    let manager = Arc::new(NamespaceManager::new(
      Arc::clone(&storage),
      NamespaceId::new(config.app_name.clone(), config.version),
      origin.clone(),
      config.app_shell.clone(),
      eviction.clone(),
    )?);

    let router = Router::new(
      config.routing_rules()?,
      Arc::clone(&storage),
      Arc::clone(&network),
      eviction.clone(),
      manager.subscribe(),
    );

    let (maintenance, maintenance_task) = MaintenanceHandle::spawn(eviction, manager.subscribe());
    let dispatcher = Dispatcher::lifecycle(
      Arc::clone(&manager),
      router,
      network,
      maintenance.clone(),
    );

    info!(namespace = %manager.current(), state = %manager.state(), "shellcache ready");

    Ok(Self {
      origin,
      storage,
      manager,
      maintenance,
      maintenance_task,
      dispatcher,
    })
  }

  pub async fn install(&self) -> Result<()> {
    expect_done(self.dispatcher.dispatch(Event::Install).await)
  }

  pub async fn activate(&self) -> Result<()> {
    expect_done(self.dispatcher.dispatch(Event::Activate).await)
  }

  /// Bring the current version to active if it is not already.
  ///
  /// Failure leaves whatever namespace was serving before in place.
  pub async fn ensure_active(&self) {
    if self.manager.state() == LifecycleState::Active {
      return;
    }
    let result = match self.manager.state() {
      LifecycleState::Activating => self.activate().await,
      _ => match self.install().await {
        Ok(()) => self.activate().await,
        Err(e) => Err(e),
      },
    };
    if let Err(e) = result {
      warn!("could not activate {}: {:#}", self.manager.current(), e);
    }
  }

  /// Issue a GET for an absolute URL or an origin-relative path.
  pub async fn fetch(&self, target: &str) -> Result<Served> {
    self.ensure_active().await;

    let url = if target.starts_with("http://") || target.starts_with("https://") {
      Url::parse(target)
    } else {
      self.origin.join(target)
    }
    .map_err(|e| eyre!("Invalid target '{}': {}", target, e))?;

    match self.dispatcher.dispatch(Event::Fetch(Request::get(url))).await {
      EventOutcome::Responded(served) => Ok(served),
      EventOutcome::Failed(e) => Err(e.into()),
      other => Err(eyre!("Unexpected fetch outcome: {:?}", other)),
    }
  }

  /// Post CLEAN_CACHE and wait for the maintenance task to get through it.
  pub async fn clean(&self) -> Result<()> {
    let payload = r#"{"type":"CLEAN_CACHE"}"#.to_string();
    expect_done(self.dispatcher.dispatch(Event::Message(payload)).await)?;
    self.maintenance.flush().await;
    Ok(())
  }

  pub fn status(&self) -> Result<Status> {
    Ok(Status {
      current: self.manager.current().clone(),
      state: self.manager.state(),
      serving: self.manager.active_namespace(),
      namespaces: self.storage.list_namespaces()?,
    })
  }

  /// Drain maintenance work before the runtime goes away.
  pub async fn shutdown(self) {
    self.maintenance.flush().await;
    self.maintenance_task.abort();
  }
}

fn expect_done(outcome: EventOutcome) -> Result<()> {
  match outcome {
    EventOutcome::Done => Ok(()),
    EventOutcome::Failed(e) => Err(e.into()),
    other => Err(eyre!("Unexpected event outcome: {:?}", other)),
  }
}
