//! Versioned response cache for offline support.
//!
//! This module provides the storage side of the interception layer:
//! - Namespaced key/value store of response snapshots (SQLite or memory)
//! - FIFO capacity and TTL age eviction
//! - Versioned namespace lifecycle with purge of superseded versions

mod eviction;
mod namespace;
mod storage;
mod traits;

pub use eviction::{EvictionEngine, EvictionPolicy, MAX_CACHE_AGE_MS, MAX_CACHE_SIZE};
pub use namespace::NamespaceManager;
#[cfg(test)]
pub use storage::MemoryStorage;
pub use storage::{CacheStorage, SqliteStorage};
#[cfg(test)]
pub use traits::CachedEntry;
pub use traits::{CacheKey, CacheSource, LifecycleState, NamespaceId, NamespaceInfo};
