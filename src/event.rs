//! Lifecycle event dispatch.
//!
//! Each event kind maps to one handler. A handler returns a future the host
//! must await to completion before it may drop the runtime.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, error};

use crate::cache::{CacheStorage, LifecycleState, NamespaceManager};
use crate::error::ShellCacheError;
use crate::maintenance::{MaintenanceHandle, Message};
use crate::net::{Network, Request};
use crate::router::{Router, Served};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
  Install,
  Activate,
  Fetch,
  Message,
}

/// Lifecycle events delivered by the host
#[derive(Debug)]
pub enum Event {
  Install,
  Activate,
  /// A request issued by the dashboard
  Fetch(Request),
  /// Raw JSON message from a client context
  Message(String),
}

impl Event {
  pub fn kind(&self) -> EventKind {
    match self {
      Event::Install => EventKind::Install,
      Event::Activate => EventKind::Activate,
      Event::Fetch(_) => EventKind::Fetch,
      Event::Message(_) => EventKind::Message,
    }
  }
}

/// What a handler produced once its future resolved
#[derive(Debug)]
pub enum EventOutcome {
  Done,
  /// Response for a fetch event
  Responded(Served),
  Failed(ShellCacheError),
  /// No handler registered for this event kind
  Unhandled,
}

pub type Handler = Arc<dyn Fn(Event) -> BoxFuture<'static, EventOutcome> + Send + Sync>;

/// Event kind -> handler map
#[derive(Default, Clone)]
pub struct Dispatcher {
  handlers: HashMap<EventKind, Handler>,
}

impl Dispatcher {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register the handler for `kind`, replacing any previous one.
  pub fn on<F, Fut>(&mut self, kind: EventKind, handler: F)
  where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = EventOutcome> + Send + 'static,
  {
    self
      .handlers
      .insert(kind, Arc::new(move |event| handler(event).boxed()));
  }

  /// Hand an event to its handler. The returned future covers all work the
  /// handler started.
  pub fn dispatch(&self, event: Event) -> BoxFuture<'static, EventOutcome> {
    match self.handlers.get(&event.kind()) {
      Some(handler) => handler(event),
      None => {
        debug!(kind = ?event.kind(), "no handler registered");
        async { EventOutcome::Unhandled }.boxed()
      }
    }
  }

  /// Wire the standard handlers for install, activate, fetch and message.
  pub fn lifecycle<S, N>(
    manager: Arc<NamespaceManager<S>>,
    router: Router<S, N>,
    network: Arc<N>,
    maintenance: MaintenanceHandle,
  ) -> Self
  where
    S: CacheStorage + 'static,
    N: Network + 'static,
  {
    let mut dispatcher = Self::new();

    let install_manager = Arc::clone(&manager);
    dispatcher.on(EventKind::Install, move |_| {
      let manager = Arc::clone(&install_manager);
      let network = Arc::clone(&network);
      async move {
        let result = async {
          manager.install(network.as_ref()).await?;
          // Take over without waiting for old clients. An already active
          // version stays as it is.
          if manager.state() == LifecycleState::Waiting {
            manager.skip_waiting()?;
          }
          Ok::<_, ShellCacheError>(())
        }
        .await;
        outcome(result)
      }
    });

    dispatcher.on(EventKind::Activate, move |_| {
      let manager = Arc::clone(&manager);
      async move {
        let result = async {
          // A version installed by an earlier run resumes as waiting
          if manager.state() == LifecycleState::Waiting {
            manager.skip_waiting()?;
          }
          manager.activate().await
        }
        .await;
        outcome(result)
      }
    });

    dispatcher.on(EventKind::Fetch, move |event| {
      let router = router.clone();
      async move {
        let Event::Fetch(request) = event else {
          return EventOutcome::Unhandled;
        };
        match router.handle(&request).await {
          Ok(intercepted) => EventOutcome::Responded(intercepted.settle().await),
          Err(e) => EventOutcome::Failed(e),
        }
      }
    });

    dispatcher.on(EventKind::Message, move |event| {
      let maintenance = maintenance.clone();
      async move {
        if let Event::Message(payload) = event {
          if let Some(message) = Message::parse(&payload) {
            maintenance.post(message);
          }
        }
        EventOutcome::Done
      }
    });

    dispatcher
  }
}

fn outcome(result: Result<(), ShellCacheError>) -> EventOutcome {
  match result {
    Ok(()) => EventOutcome::Done,
    Err(e) => {
      error!("{}", e);
      EventOutcome::Failed(e)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{
    CacheKey, CacheSource, EvictionEngine, EvictionPolicy, MemoryStorage, NamespaceId,
    SqliteStorage,
  };
  use crate::net::stub::StubNetwork;
  use crate::router::{Decision, RoutingRules};
  use url::Url;

  struct Harness {
    dispatcher: Dispatcher,
    storage: Arc<MemoryStorage>,
    network: Arc<StubNetwork>,
    manager: Arc<NamespaceManager<MemoryStorage>>,
    maintenance: MaintenanceHandle,
  }

  fn origin() -> Url {
    Url::parse("https://dash.example").unwrap()
  }

  fn wire<S: CacheStorage + 'static>(
    storage: Arc<S>,
    network: Arc<StubNetwork>,
  ) -> (Dispatcher, Arc<NamespaceManager<S>>, MaintenanceHandle) {
    let shell = vec!["/".to_string(), "/manifest.json".to_string()];
    let eviction = EvictionEngine::new(storage.clone(), EvictionPolicy::default());
    let manager = Arc::new(
      NamespaceManager::new(
        storage.clone(),
        NamespaceId::new("dashboard", 1),
        origin(),
        shell.clone(),
        eviction.clone(),
      )
      .unwrap(),
    );
    let router = Router::new(
      RoutingRules::new(origin(), shell),
      storage,
      network.clone(),
      eviction.clone(),
      manager.subscribe(),
    );
    let (maintenance, _task) = MaintenanceHandle::spawn(eviction, manager.subscribe());
    let dispatcher = Dispatcher::lifecycle(manager.clone(), router, network, maintenance.clone());
    (dispatcher, manager, maintenance)
  }

  fn harness(network: StubNetwork) -> Harness {
    let storage = Arc::new(MemoryStorage::new());
    let network = Arc::new(network);
    let (dispatcher, manager, maintenance) = wire(storage.clone(), network.clone());

    Harness {
      dispatcher,
      storage,
      network,
      manager,
      maintenance,
    }
  }

  fn shell_network() -> StubNetwork {
    StubNetwork::new()
      .ok("/", "<html>", None)
      .ok("/manifest.json", "{}", None)
  }

  fn get(path: &str) -> Request {
    Request::get(origin().join(path).unwrap())
  }

  #[tokio::test]
  async fn test_unregistered_event_is_unhandled() {
    let dispatcher = Dispatcher::new();
    let outcome = dispatcher.dispatch(Event::Install).await;
    assert!(matches!(outcome, EventOutcome::Unhandled));
  }

  #[tokio::test]
  async fn test_custom_handler_replaces_previous() {
    let mut dispatcher = Dispatcher::new();
    dispatcher.on(EventKind::Activate, |_| async { EventOutcome::Unhandled });
    dispatcher.on(EventKind::Activate, |_| async { EventOutcome::Done });
    let outcome = dispatcher.dispatch(Event::Activate).await;
    assert!(matches!(outcome, EventOutcome::Done));
  }

  #[tokio::test]
  async fn test_install_activate_then_fetch() {
    let h = harness(shell_network().ok("/app.js", "js", None));

    assert!(matches!(
      h.dispatcher.dispatch(Event::Install).await,
      EventOutcome::Done
    ));
    assert_eq!(h.manager.state(), LifecycleState::Activating);
    assert!(matches!(
      h.dispatcher.dispatch(Event::Activate).await,
      EventOutcome::Done
    ));
    assert_eq!(h.manager.state(), LifecycleState::Active);

    let outcome = h.dispatcher.dispatch(Event::Fetch(get("/app.js"))).await;
    let EventOutcome::Responded(served) = outcome else {
      panic!("expected a response, got {:?}", outcome);
    };
    assert_eq!(served.decision, Decision::NetworkFirstWithCacheFallback);

    // Cache work is settled by the time the handler resolves
    assert!(h
      .storage
      .get("dashboard-cache-v1", &CacheKey::for_request(&get("/app.js")))
      .unwrap()
      .is_some());

    h.network.go_offline_all();
    let outcome = h.dispatcher.dispatch(Event::Fetch(get("/"))).await;
    let EventOutcome::Responded(served) = outcome else {
      panic!("expected a response, got {:?}", outcome);
    };
    assert_eq!(served.source, CacheSource::Cache);
    assert_eq!(served.response.body, b"<html>".to_vec());
  }

  #[tokio::test]
  async fn test_install_failure_is_reported() {
    let h = harness(StubNetwork::new().ok("/", "<html>", None));
    let outcome = h.dispatcher.dispatch(Event::Install).await;
    assert!(matches!(
      outcome,
      EventOutcome::Failed(ShellCacheError::InstallFailure { .. })
    ));
    assert_eq!(h.manager.state(), LifecycleState::Uninstalled);
  }

  #[tokio::test]
  async fn test_clean_cache_message_has_no_reply() {
    let h = harness(shell_network());
    h.dispatcher.dispatch(Event::Install).await;
    h.dispatcher.dispatch(Event::Activate).await;

    let outcome = h
      .dispatcher
      .dispatch(Event::Message(r#"{"type":"CLEAN_CACHE"}"#.to_string()))
      .await;
    assert!(matches!(outcome, EventOutcome::Done));
    h.maintenance.flush().await;

    let outcome = h
      .dispatcher
      .dispatch(Event::Message(r#"{"type":"PING"}"#.to_string()))
      .await;
    assert!(matches!(outcome, EventOutcome::Done));
  }

  #[tokio::test]
  async fn test_reinstall_of_active_version_is_done() {
    let h = harness(shell_network());
    h.dispatcher.dispatch(Event::Install).await;
    h.dispatcher.dispatch(Event::Activate).await;
    assert_eq!(h.manager.state(), LifecycleState::Active);

    let outcome = h.dispatcher.dispatch(Event::Install).await;
    assert!(matches!(outcome, EventOutcome::Done), "got {:?}", outcome);
    assert_eq!(h.manager.state(), LifecycleState::Active);
  }

  #[tokio::test]
  async fn test_activate_in_a_later_run_takes_over_waiting_version() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let network = Arc::new(shell_network());

    {
      let storage = Arc::new(SqliteStorage::open(&path).unwrap());
      let (dispatcher, manager, _) = wire(storage, network.clone());
      assert!(matches!(
        dispatcher.dispatch(Event::Install).await,
        EventOutcome::Done
      ));
      assert_eq!(manager.state(), LifecycleState::Activating);
    }

    let storage = Arc::new(SqliteStorage::open(&path).unwrap());
    let (dispatcher, manager, _) = wire(storage.clone(), network);
    assert_eq!(manager.state(), LifecycleState::Waiting);

    let outcome = dispatcher.dispatch(Event::Activate).await;
    assert!(matches!(outcome, EventOutcome::Done), "got {:?}", outcome);
    assert_eq!(manager.state(), LifecycleState::Active);
    assert_eq!(
      manager.active_namespace().as_deref(),
      Some("dashboard-cache-v1")
    );
    assert!(storage
      .get("dashboard-cache-v1", &CacheKey::for_request(&get("/")))
      .unwrap()
      .is_some());
  }
}
