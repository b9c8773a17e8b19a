//! The provider cache facade
//!
//! [`ProviderCache`] is the only surface agents and read-side consumers see.
//! It owns the backing store, the configuration and the scope lock table,
//! batches large reads and evictions, and routes every write through the
//! merge engine.

use crate::agent::AgentDataType;
use crate::config::CacheConfig;
use crate::data::CacheData;
use crate::error::Result;
use crate::filter::RelationshipFilter;
use crate::invalidation::InvalidationEvent;
use crate::key::Glob;
use crate::locks::ScopeLocks;
use crate::merge::{self, MergeReport};
use crate::relationships::References;
use crate::result::CacheResult;
use crate::stats::CacheStats;
use crate::store::{self, CacheStore, InMemoryCacheStore};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Namespaced view over a cache store
pub struct ProviderCache {
    store: Arc<dyn CacheStore>,
    config: CacheConfig,
    locks: ScopeLocks,
}

impl ProviderCache {
    /// Validate the configuration and wrap a store
    pub fn new(store: Arc<dyn CacheStore>, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        info!(
            "Creating provider cache over {} store (lock shards: {})",
            store.name(),
            config.lock_shards
        );
        let locks = ScopeLocks::new(config.lock_shards);

        Ok(Self {
            store,
            config,
            locks,
        })
    }

    /// Build a cache over a fresh in-memory store
    pub fn in_memory(config: CacheConfig) -> Result<Self> {
        let store = Arc::new(InMemoryCacheStore::new(config.clone()));
        Self::new(store, config)
    }

    /// The backing store
    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Active configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub(crate) fn locks(&self) -> &ScopeLocks {
        &self.locks
    }

    /// Keys in a namespace matching a glob pattern
    pub async fn filter_identifiers(&self, namespace: &str, pattern: &str) -> Result<BTreeSet<String>> {
        let glob = Glob::new(pattern)?;
        self.store.filter_identifiers(namespace, &glob).await
    }

    /// Every key in a namespace
    pub async fn get_identifiers(&self, namespace: &str) -> Result<BTreeSet<String>> {
        self.store.get_identifiers(namespace).await
    }

    /// Fetch one record; `None` when absent
    pub async fn get(
        &self,
        namespace: &str,
        key: &str,
        filter: &RelationshipFilter,
    ) -> Result<Option<CacheData>> {
        let mut found = self
            .store
            .get_all(namespace, &[key.to_string()], filter)
            .await?;
        Ok(found.pop())
    }

    /// Fetch many records, batched; missing keys are omitted
    pub async fn get_all(
        &self,
        namespace: &str,
        keys: &[String],
        filter: &RelationshipFilter,
    ) -> Result<Vec<CacheData>> {
        let mut found = Vec::with_capacity(keys.len());
        for batch in keys.chunks(self.config.max_get_batch_size) {
            found.extend(self.store.get_all(namespace, batch, filter).await?);
        }
        Ok(found)
    }

    /// Fetch every record whose key matches a glob pattern
    pub async fn get_all_matching(
        &self,
        namespace: &str,
        pattern: &str,
        filter: &RelationshipFilter,
    ) -> Result<Vec<CacheData>> {
        let keys: Vec<String> = self
            .filter_identifiers(namespace, pattern)
            .await?
            .into_iter()
            .collect();
        self.get_all(namespace, &keys, filter).await
    }

    /// Merge one agent run's result; the only write path for agents
    pub async fn put_cache_result(
        &self,
        agent_type: &str,
        data_types: &[AgentDataType],
        result: CacheResult,
    ) -> Result<MergeReport> {
        merge::merge_result(self, agent_type, data_types, result).await
    }

    /// Delete keys from a namespace; returns how many existed
    pub async fn evict(&self, namespace: &str, keys: &[String]) -> Result<usize> {
        Ok(self.evict_batched(namespace, keys).await?.len())
    }

    pub(crate) async fn evict_batched(&self, namespace: &str, keys: &[String]) -> Result<Vec<String>> {
        let mut evicted = Vec::new();
        for batch in keys.chunks(self.config.max_evict_batch_size) {
            evicted.extend(self.store.evict_all(namespace, batch).await?);
        }
        if !evicted.is_empty() {
            debug!("Evicted {} of {} keys from {}", evicted.len(), keys.len(), namespace);
        }
        Ok(evicted)
    }

    /// Records referencing `key`, restricted to the namespaces in `filter`
    pub async fn references_to(&self, key: &str, filter: &RelationshipFilter) -> Result<References> {
        let mut refs = self.store.references_to(key).await?;
        refs.retain(|namespace, _| filter.includes(namespace));
        Ok(refs)
    }

    /// Namespaces currently holding records
    pub async fn namespaces(&self) -> Result<Vec<String>> {
        self.store.namespaces().await
    }

    /// Sweep records whose TTL has elapsed
    pub async fn cleanup_expired(&self) -> Result<Vec<InvalidationEvent>> {
        self.store.cleanup_expired().await
    }

    /// Store counters
    pub async fn stats(&self) -> Result<CacheStats> {
        self.store.stats().await
    }

    /// Spawn the background expiry sweep if enabled in the configuration
    pub fn spawn_auto_cleanup(&self) -> Option<JoinHandle<()>> {
        if !self.config.enable_auto_cleanup {
            return None;
        }
        let store = self.store.clone();
        let interval = self.config.cleanup_interval;
        Some(tokio::spawn(store::start_auto_cleanup(store, interval)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use serde_json::json;

    fn cache(get_batch: usize) -> ProviderCache {
        ProviderCache::in_memory(
            CacheConfig::builder()
                .max_get_batch_size(get_batch)
                .max_evict_batch_size(2)
                .enable_auto_cleanup(false)
                .build(),
        )
        .unwrap()
    }

    async fn seed(cache: &ProviderCache, count: usize) -> Vec<String> {
        let items: Vec<CacheData> = (0..count)
            .map(|i| CacheData::new(format!("aws:instances:prod:us-east-1:i-{}", i)).with_attribute("n", i))
            .collect();
        let keys = items.iter().map(|item| item.id.clone()).collect();
        cache.store().merge_all("instances", &items).await.unwrap();
        keys
    }

    #[tokio::test]
    async fn test_get_absent_is_none() {
        let cache = cache(10);
        let found = cache
            .get("instances", "aws:instances:prod:us-east-1:i-404", &RelationshipFilter::All)
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_get_all_batches() {
        let cache = cache(3);
        let mut keys = seed(&cache, 7).await;
        keys.push("aws:instances:prod:us-east-1:i-missing".to_string());

        let found = cache.get_all("instances", &keys, &RelationshipFilter::None).await.unwrap();
        assert_eq!(found.len(), 7);

        let one = cache.get("instances", &keys[4], &RelationshipFilter::None).await.unwrap().unwrap();
        assert_eq!(one.attribute("n"), Some(&json!(4)));
    }

    #[tokio::test]
    async fn test_get_all_matching_and_evict() {
        let cache = cache(10);
        let keys = seed(&cache, 5).await;

        let matching = cache
            .get_all_matching("instances", "aws:instances:prod:*:i-?", &RelationshipFilter::None)
            .await
            .unwrap();
        assert_eq!(matching.len(), 5);

        let evicted = cache.evict("instances", &keys[..3]).await.unwrap();
        assert_eq!(evicted, 3);
        assert_eq!(cache.get_identifiers("instances").await.unwrap().len(), 2);

        // evicting again is a no-op
        assert_eq!(cache.evict("instances", &keys[..3]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_glob_brackets_are_literal() {
        let cache = cache(10);
        assert!(cache.filter_identifiers("instances", "aws:instances:[").await.is_ok());
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let store: Arc<dyn CacheStore> = Arc::new(InMemoryCacheStore::new(CacheConfig::default()));
        for config in [
            CacheConfig::builder().max_get_batch_size(0).build(),
            CacheConfig::builder().max_evict_batch_size(0).build(),
            CacheConfig::builder().max_merge_batch_size(0).build(),
        ] {
            let result = ProviderCache::new(store.clone(), config);
            assert!(matches!(result, Err(CacheError::ConfigError(_))));
        }
        assert!(ProviderCache::new(store, CacheConfig::default()).is_ok());
    }

    #[test]
    fn test_auto_cleanup_disabled() {
        let cache = cache(10);
        assert!(cache.spawn_auto_cleanup().is_none());
    }
}
