//! Capacity (FIFO) and age (TTL) eviction within a namespace.
//!
//! Both passes enumerate keys first and delete afterwards, yielding between
//! deletes. A write landing mid-pass may be missed by that pass; the next
//! trigger picks it up.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use tracing::{debug, info};

use super::storage::CacheStorage;

/// Default maximum number of entries per namespace
pub const MAX_CACHE_SIZE: usize = 50;

/// Default maximum entry age (7 days)
pub const MAX_CACHE_AGE_MS: i64 = 604_800_000;

/// Bounds enforced by the eviction engine.
#[derive(Debug, Clone, Copy)]
pub struct EvictionPolicy {
  pub max_entries: usize,
  pub max_age: Duration,
}

impl Default for EvictionPolicy {
  fn default() -> Self {
    Self {
      max_entries: MAX_CACHE_SIZE,
      max_age: Duration::milliseconds(MAX_CACHE_AGE_MS),
    }
  }
}

pub struct EvictionEngine<S: CacheStorage> {
  storage: Arc<S>,
  policy: EvictionPolicy,
}

impl<S: CacheStorage> EvictionEngine<S> {
  pub fn new(storage: Arc<S>, policy: EvictionPolicy) -> Self {
    Self { storage, policy }
  }

  /// Drop the oldest-inserted entries until at most `max_entries` remain.
  ///
  /// Returns the number of entries deleted. Access recency plays no part.
  pub async fn enforce_capacity(&self, namespace: &str) -> Result<usize> {
    let keys = self.storage.keys_in_insertion_order(namespace)?;
    if keys.len() <= self.policy.max_entries {
      return Ok(0);
    }

    let excess = keys.len() - self.policy.max_entries;
    let mut evicted = 0;
    for key in keys.into_iter().take(excess) {
      if self.storage.delete(namespace, &key)? {
        debug!(%key, namespace, "evicted by capacity");
        evicted += 1;
      }
      tokio::task::yield_now().await;
    }

    info!(namespace, evicted, "capacity check complete");
    Ok(evicted)
  }

  /// Delete every entry whose `Date` header is older than `max_age` at `now`.
  ///
  /// Entries without a parseable `Date` header never expire.
  pub async fn sweep_expired(&self, namespace: &str, now: DateTime<Utc>) -> Result<usize> {
    let keys = self.storage.keys_in_insertion_order(namespace)?;
    let mut evicted = 0;

    for key in keys {
      // Entry may have been removed since enumeration
      let Some(entry) = self.storage.get(namespace, &key)? else {
        continue;
      };
      let Some(timestamp) = entry.response.timestamp() else {
        continue;
      };

      let age = now - timestamp.with_timezone(&Utc);
      if age > self.policy.max_age && self.storage.delete(namespace, &key)? {
        debug!(%key, namespace, seq = entry.seq, age_hours = age.num_hours(), "evicted by age");
        evicted += 1;
      }
      tokio::task::yield_now().await;
    }

    info!(namespace, evicted, "age sweep complete");
    Ok(evicted)
  }
}

impl<S: CacheStorage> Clone for EvictionEngine<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      policy: self.policy,
    }
  }
}
