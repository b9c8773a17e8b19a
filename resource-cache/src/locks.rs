//! Sharded per-scope locks for authoritative merges
//!
//! A merge holds the lock for its (namespace, scope glob) across the
//! read, upsert and evict sequence. Different scopes hash to shards and
//! only contend when they collide on the same shard.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Guard held for the duration of one scope merge
pub type ScopeGuard = OwnedMutexGuard<()>;

/// Lock table keyed by (namespace, scope)
#[derive(Debug)]
pub struct ScopeLocks {
    shards: Vec<Arc<Mutex<()>>>,
}

impl ScopeLocks {
    /// Create a table with `shards` mutexes (at least one)
    pub fn new(shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| Arc::new(Mutex::new(()))).collect(),
        }
    }

    /// Number of shards
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard index for a scope
    pub fn shard_for(&self, namespace: &str, scope: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        namespace.hash(&mut hasher);
        scope.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Wait for and take the lock for a scope
    pub async fn lock(&self, namespace: &str, scope: &str) -> ScopeGuard {
        let shard = self.shard_for(namespace, scope);
        debug!("Acquiring scope lock {}/{} (shard {})", namespace, scope, shard);
        self.shards[shard].clone().lock_owned().await
    }
}

impl Default for ScopeLocks {
    fn default() -> Self {
        Self::new(16)
    }
}
