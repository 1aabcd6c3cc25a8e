//! Out-of-band cache upkeep, independent of request traffic.
//!
//! Commands are fire-and-forget: the sender gets nothing back, and results
//! only show up in logs and in the cache contents afterwards.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheStorage, EvictionEngine};
use crate::error::ShellCacheError;

/// Messages accepted from client contexts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
  /// Run the age sweep and the capacity check on the active namespace
  CleanCache,
}

impl Message {
  /// Parse a JSON message payload. Unknown shapes are logged and dropped.
  pub fn parse(payload: &str) -> Option<Self> {
    match serde_json::from_str(payload) {
      Ok(message) => Some(message),
      Err(e) => {
        debug!(%payload, "ignoring unrecognized message: {}", e);
        None
      }
    }
  }
}

enum Command {
  Run(Message),
  Flush(oneshot::Sender<()>),
}

/// Sending side of the maintenance channel. Cheap to clone.
#[derive(Clone)]
pub struct MaintenanceHandle {
  tx: mpsc::UnboundedSender<Command>,
}

impl MaintenanceHandle {
  /// Start the maintenance task.
  pub fn spawn<S>(
    eviction: EvictionEngine<S>,
    active: watch::Receiver<Option<String>>,
  ) -> (Self, JoinHandle<()>)
  where
    S: CacheStorage + 'static,
  {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
      while let Some(command) = rx.recv().await {
        match command {
          Command::Run(Message::CleanCache) => {
            let namespace = active.borrow().clone();
            match namespace {
              Some(namespace) => clean(&eviction, &namespace).await,
              None => debug!("no active namespace, nothing to clean"),
            }
          }
          Command::Flush(ack) => {
            let _ = ack.send(());
          }
        }
      }
      debug!("maintenance channel closed");
    });

    (Self { tx }, task)
  }

  /// Queue a message. Returns immediately with no result.
  pub fn post(&self, message: Message) {
    if self.tx.send(Command::Run(message)).is_err() {
      warn!("maintenance task is gone, message dropped");
    }
  }

  /// Wait until everything posted before this call has been processed.
  pub async fn flush(&self) {
    let (ack_tx, ack_rx) = oneshot::channel();
    if self.tx.send(Command::Flush(ack_tx)).is_ok() {
      let _ = ack_rx.await;
    }
  }
}

/// Age sweep and capacity check, run concurrently.
async fn clean<S: CacheStorage>(eviction: &EvictionEngine<S>, namespace: &str) {
  let (swept, capped) = futures::join!(
    eviction.sweep_expired(namespace, Utc::now()),
    eviction.enforce_capacity(namespace)
  );

  match swept {
    Ok(n) => info!(namespace, evicted = n, "clean: age sweep done"),
    Err(e) => warn!(namespace, "{}", ShellCacheError::MaintenanceFailure(format!("sweep: {:#}", e))),
  }
  match capped {
    Ok(n) => info!(namespace, evicted = n, "clean: capacity check done"),
    Err(e) => warn!(namespace, "{}", ShellCacheError::MaintenanceFailure(format!("capacity: {:#}", e))),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  use chrono::Duration;

  use crate::cache::{CacheKey, EvictionPolicy, LifecycleState, MemoryStorage};
  use crate::net::{Headers, Response};

  const NS: &str = "dashboard-cache-v1";

  fn key(n: usize) -> CacheKey {
    CacheKey::from(format!("GET https://dash.example/e{}.js", n))
  }

  fn response(age_days: Option<i64>) -> Response {
    let mut headers = Headers::new();
    if let Some(days) = age_days {
      headers.set("date", (Utc::now() - Duration::days(days)).to_rfc2822());
    }
    Response::new(200, headers, b"x".to_vec())
  }

  #[test]
  fn test_parse_clean_cache_message() {
    assert_eq!(
      Message::parse(r#"{"type":"CLEAN_CACHE"}"#),
      Some(Message::CleanCache)
    );
    assert_eq!(Message::parse(r#"{"type":"SKIP_WAITING"}"#), None);
    assert_eq!(Message::parse("not json"), None);
  }

  #[tokio::test]
  async fn test_clean_cache_runs_sweep_and_capacity() {
    let storage = Arc::new(MemoryStorage::new());
    storage.open_namespace(NS, LifecycleState::Active).unwrap();
    let eviction = EvictionEngine::new(
      storage.clone(),
      EvictionPolicy {
        max_entries: 3,
        ..EvictionPolicy::default()
      },
    );

    // e1 expired, e2..e6 fresh: over capacity by at least two
    storage.put(NS, &key(1), &response(Some(8))).unwrap();
    for n in 2..=6 {
      storage.put(NS, &key(n), &response(Some(1))).unwrap();
    }

    let (_tx, rx) = watch::channel(Some(NS.to_string()));
    let (handle, _task) = MaintenanceHandle::spawn(eviction, rx);

    // Fire-and-forget: post hands nothing back
    handle.post(Message::CleanCache);
    handle.flush().await;

    let keys = storage.keys_in_insertion_order(NS).unwrap();
    assert!(keys.len() <= 3, "capacity not enforced: {:?}", keys);
    assert!(!keys.contains(&key(1)));
    assert!(keys.contains(&key(6)));
  }

  #[tokio::test]
  async fn test_clean_without_active_namespace_is_harmless() {
    let storage = Arc::new(MemoryStorage::new());
    let eviction = EvictionEngine::new(storage, EvictionPolicy::default());
    let (_tx, rx) = watch::channel(None);
    let (handle, _task) = MaintenanceHandle::spawn(eviction, rx);

    handle.post(Message::CleanCache);
    handle.flush().await;
  }
}
