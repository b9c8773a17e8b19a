//! In-process cache store with TTL expiry and relationship indexing

use crate::config::CacheConfig;
use crate::data::CacheData;
use crate::error::Result;
use crate::filter::RelationshipFilter;
use crate::invalidation::{InvalidationEvent, InvalidationReason};
use crate::key::Glob;
use crate::relationships::{References, RelationshipIndex};
use crate::stats::CacheStats;
use crate::store::entry::StoredEntry;
use crate::store::{CacheStore, MergeOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Process-local cache store
///
/// This implementation provides:
/// - Thread-safe async access via RwLock, one write lock per batch
/// - Reads under the shared lock; hit and miss counters are atomics
/// - Per-record TTL with jitter, expired records hidden from reads until swept
/// - Content-hash skipping of unchanged writes
/// - A reverse relationship index maintained alongside every write
pub struct InMemoryCacheStore {
    /// Cache configuration
    config: CacheConfig,

    /// Internal storage
    state: Arc<RwLock<StoreState>>,

    /// Read counters, updated without the write lock
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Internal storage
#[derive(Default)]
struct StoreState {
    /// namespace -> key -> entry
    namespaces: HashMap<String, HashMap<String, StoredEntry>>,

    /// Reverse relationships
    index: RelationshipIndex,

    /// Current cache statistics
    stats: CacheStats,
}

impl InMemoryCacheStore {
    /// Create a new store with the given configuration
    pub fn new(config: CacheConfig) -> Self {
        info!("Initializing in-memory cache store with config: {:?}", config);

        Self {
            config,
            state: Arc::new(RwLock::new(StoreState::default())),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Store configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Number of live and not yet swept records
    pub async fn len(&self) -> usize {
        let state = self.state.read().await;
        state.namespaces.values().map(HashMap::len).sum()
    }

    /// Check if the store is empty
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every record
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        let count: usize = state.namespaces.values().map(HashMap::len).sum();
        state.namespaces.clear();
        state.index = RelationshipIndex::new();
        state.stats.evictions += count as u64;

        info!("Cleared {} entries from cache store", count);
    }

    /// Stored entry with its metadata, unhydrated
    pub async fn entry(&self, namespace: &str, key: &str) -> Option<StoredEntry> {
        let state = self.state.read().await;
        state
            .namespaces
            .get(namespace)
            .and_then(|entries| entries.get(key))
            .filter(|entry| !entry.is_expired())
            .cloned()
    }
}

impl StoreState {
    fn entries(&self, namespace: &str) -> impl Iterator<Item = (&String, &StoredEntry)> {
        self.namespaces.get(namespace).into_iter().flatten()
    }

    /// Remove a record, its forward edges, and every edge pointing at it
    fn remove_entry(&mut self, namespace: &str, key: &str) -> Option<StoredEntry> {
        let entry = self.namespaces.get_mut(namespace)?.remove(key)?;
        self.index.unlink_all(namespace, key, &entry.data.relationships);

        for (source_namespace, sources) in self.index.detach_target(key) {
            let Some(entries) = self.namespaces.get_mut(&source_namespace) else {
                continue;
            };
            for source in sources {
                if let Some(source_entry) = entries.get_mut(&source) {
                    source_entry.strip_related(key);
                }
            }
        }

        if self.namespaces.get(namespace).is_some_and(HashMap::is_empty) {
            self.namespaces.remove(namespace);
        }
        Some(entry)
    }

    fn expired_keys(&self, now: DateTime<Utc>) -> BTreeMap<String, Vec<String>> {
        let mut expired: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (namespace, entries) in &self.namespaces {
            for (key, entry) in entries {
                if entry.is_expired_at(now) {
                    expired.entry(namespace.clone()).or_default().push(key.clone());
                }
            }
        }
        expired
    }

    fn is_live(&self, namespace: &str, key: &str, now: DateTime<Utc>) -> bool {
        self.namespaces
            .get(namespace)
            .and_then(|entries| entries.get(key))
            .is_some_and(|entry| !entry.is_expired_at(now))
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get_identifiers(&self, namespace: &str) -> Result<BTreeSet<String>> {
        let state = self.state.read().await;
        let now = Utc::now();

        Ok(state
            .entries(namespace)
            .filter(|(_, entry)| !entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn filter_identifiers(&self, namespace: &str, glob: &Glob) -> Result<BTreeSet<String>> {
        let state = self.state.read().await;
        let now = Utc::now();

        if let Some(key) = glob.literal_key() {
            let mut found = BTreeSet::new();
            if state.is_live(namespace, &key, now) {
                found.insert(key);
            }
            return Ok(found);
        }

        Ok(state
            .entries(namespace)
            .filter(|(key, entry)| !entry.is_expired_at(now) && glob.matches(key))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn get_all(
        &self,
        namespace: &str,
        keys: &[String],
        filter: &RelationshipFilter,
    ) -> Result<Vec<CacheData>> {
        let state = self.state.read().await;
        let now = Utc::now();

        let mut found = Vec::with_capacity(keys.len());
        let mut misses = 0u64;

        for key in keys {
            match state.namespaces.get(namespace).and_then(|entries| entries.get(key)) {
                // Left in place for cleanup_expired to remove and report
                Some(entry) if entry.is_expired_at(now) => {
                    debug!("Cache entry expired: {}", key);
                    misses += 1;
                }
                Some(entry) => {
                    found.push(CacheData {
                        id: entry.data.id.clone(),
                        attributes: entry.data.attributes.clone(),
                        relationships: state.index.hydrate(key, &entry.data.relationships, filter),
                        ttl_seconds: entry.data.ttl_seconds,
                    });
                }
                None => misses += 1,
            }
        }

        self.hits.fetch_add(found.len() as u64, Ordering::Relaxed);
        self.misses.fetch_add(misses, Ordering::Relaxed);

        Ok(found)
    }

    async fn merge_all(&self, namespace: &str, items: &[CacheData]) -> Result<MergeOutcome> {
        // Hash outside the lock
        let hashes = if self.config.hashing_enabled {
            items
                .iter()
                .map(|item| item.content_hash().map(Some))
                .collect::<Result<Vec<_>>>()?
        } else {
            vec![None; items.len()]
        };

        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let now = Utc::now();
        let mut outcome = MergeOutcome::default();

        for (item, hash) in items.iter().zip(hashes) {
            let ttl = self.config.effective_ttl(item.ttl_seconds);

            let expired = state
                .namespaces
                .get(namespace)
                .and_then(|entries| entries.get(&item.id))
                .is_some_and(|entry| entry.is_expired_at(now));
            if expired {
                state.remove_entry(namespace, &item.id);
                state.stats.expirations += 1;
            }

            let entries = state.namespaces.entry(namespace.to_string()).or_default();
            match entries.get_mut(&item.id) {
                Some(entry) if hash.is_some() && entry.metadata.write_hash == hash => {
                    debug!("Skipping unchanged write: {}", item.id);
                    entry.refresh_ttl(ttl);
                    outcome.skipped += 1;
                }
                Some(entry) => {
                    debug!("Updating cache entry: {}", item.id);
                    entry.apply(item, ttl, hash);
                    state.index.link_all(namespace, &item.id, &item.relationships);
                    outcome.written += 1;
                }
                None => {
                    debug!("Inserting cache entry: {}", item.id);
                    entries.insert(item.id.clone(), StoredEntry::new(item.clone(), ttl, hash));
                    state.index.link_all(namespace, &item.id, &item.relationships);
                    outcome.written += 1;
                }
            }
        }

        state.stats.items_merged += outcome.written as u64;
        state.stats.writes_skipped += outcome.skipped as u64;

        Ok(outcome)
    }

    async fn evict_all(&self, namespace: &str, keys: &[String]) -> Result<Vec<String>> {
        let mut state = self.state.write().await;

        let evicted: Vec<String> = keys
            .iter()
            .filter(|key| state.remove_entry(namespace, key).is_some())
            .cloned()
            .collect();

        state.stats.evictions += evicted.len() as u64;
        if !evicted.is_empty() {
            debug!("Evicted {} entries from {}", evicted.len(), namespace);
        }

        Ok(evicted)
    }

    async fn references_to(&self, key: &str) -> Result<References> {
        let state = self.state.read().await;
        Ok(state.index.references_to(key, &RelationshipFilter::All))
    }

    async fn namespaces(&self) -> Result<Vec<String>> {
        let state = self.state.read().await;
        let mut names: Vec<String> = state
            .namespaces
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn cleanup_expired(&self) -> Result<Vec<InvalidationEvent>> {
        let mut state = self.state.write().await;
        let mut events = Vec::new();

        for (namespace, keys) in state.expired_keys(Utc::now()) {
            for key in &keys {
                state.remove_entry(&namespace, key);
            }
            state.stats.expirations += keys.len() as u64;

            debug!("Cleaned up {} expired entries in {}", keys.len(), namespace);
            let context = format!("Cleaned up {} expired entries", keys.len());
            events.push(
                InvalidationEvent::new(InvalidationReason::Expired, namespace, keys)
                    .with_context(context),
            );
        }

        Ok(events)
    }

    async fn stats(&self) -> Result<CacheStats> {
        let state = self.state.read().await;
        let mut stats = state.stats.clone();
        stats.hits = self.hits.load(Ordering::Relaxed);
        stats.misses = self.misses.load(Ordering::Relaxed);

        if self.config.enable_metrics {
            let entries = state.namespaces.values().flat_map(HashMap::values);
            let (count, size) = entries.fold((0, 0), |(count, size), entry| {
                (count + 1, size + entry.metadata.size_bytes)
            });
            stats.entries = count;
            stats.size_bytes = size;
        }

        Ok(stats)
    }
}
