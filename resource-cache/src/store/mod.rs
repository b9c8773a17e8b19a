//! Swappable backing stores
//!
//! The [`CacheStore`] trait is the seam between the provider cache facade and
//! whatever persists records. Two implementations ship with the crate:
//!
//! - [`InMemoryCacheStore`]: process-local maps behind a tokio `RwLock`
//! - [`Neo4jCacheStore`]: records as graph nodes, relationships as edges
//!
//! Both match glob queries with [`Glob`](crate::key::Glob), so a pattern
//! selects the same keys whichever store is behind the facade.

pub mod entry;
pub mod memory;
pub mod neo4j;

pub use entry::{EntryMetadata, StoredEntry};
pub use memory::InMemoryCacheStore;
pub use neo4j::{Neo4jCacheStore, Neo4jClient, Neo4jStoreConfig};

use crate::data::CacheData;
use crate::error::Result;
use crate::filter::RelationshipFilter;
use crate::invalidation::InvalidationEvent;
use crate::key::Glob;
use crate::relationships::References;
use crate::stats::CacheStats;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of one `merge_all` batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Records inserted or updated
    pub written: usize,

    /// Records whose content hash matched the previous write
    pub skipped: usize,
}

impl MergeOutcome {
    /// Fold another batch into this one
    pub fn absorb(&mut self, other: MergeOutcome) {
        self.written += other.written;
        self.skipped += other.skipped;
    }
}

/// Backing storage for cached records
///
/// Every method is scoped to one namespace except the reverse lookup, which
/// spans all of them. Implementations apply each record's upsert atomically;
/// a reader never observes half of a merge for one key.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// All live keys in a namespace
    async fn get_identifiers(&self, namespace: &str) -> Result<BTreeSet<String>>;

    /// Live keys in a namespace matching a glob
    async fn filter_identifiers(&self, namespace: &str, glob: &Glob) -> Result<BTreeSet<String>>;

    /// Fetch records; missing or expired keys are omitted
    async fn get_all(
        &self,
        namespace: &str,
        keys: &[String],
        filter: &RelationshipFilter,
    ) -> Result<Vec<CacheData>>;

    /// Upsert records: attributes overwrite per field, relationships union
    async fn merge_all(&self, namespace: &str, items: &[CacheData]) -> Result<MergeOutcome>;

    /// Delete records and strip them from every relationship set
    ///
    /// Returns the keys that were actually present.
    async fn evict_all(&self, namespace: &str, keys: &[String]) -> Result<Vec<String>>;

    /// Records referencing `key`, by source namespace
    async fn references_to(&self, key: &str) -> Result<References>;

    /// Namespaces holding at least one record
    async fn namespaces(&self) -> Result<Vec<String>>;

    /// Remove every record whose TTL has elapsed
    async fn cleanup_expired(&self) -> Result<Vec<InvalidationEvent>>;

    /// Snapshot of the store's counters
    async fn stats(&self) -> Result<CacheStats>;
}

/// Background task that sweeps expired records from a store
pub async fn start_auto_cleanup(store: Arc<dyn CacheStore>, interval: Duration) {
    info!(
        "Starting automatic cache cleanup task for {} store (interval: {:?})",
        store.name(),
        interval
    );

    loop {
        tokio::time::sleep(interval).await;

        match store.cleanup_expired().await {
            Ok(events) => {
                if !events.is_empty() {
                    debug!("Auto cleanup: {} events", events.len());
                }
            }
            Err(e) => {
                warn!("Auto cleanup failed: {}", e);
            }
        }
    }
}
