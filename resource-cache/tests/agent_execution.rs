//! Integration tests for agent execution
//!
//! A poll that fails or times out must merge nothing, and optimistic
//! concurrency conflicts in the store must be retried from a fresh read.

use async_trait::async_trait;
use resource_cache::{
    AgentDataType, AgentExecution, AgentRegistry, CacheConfig, CacheData, CacheError, CacheResult,
    CacheStats, CacheStore, CachingAgent, Glob, InMemoryCacheStore, InvalidationEvent,
    MergeOutcome, ProviderCache, References, RelationshipFilter, Result,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SCOPE: &str = "aws:images:prod:us-east-1:*";

enum Behaviour {
    Succeed,
    FailMidway,
    Hang,
}

struct ImageAgent {
    name: String,
    images: Vec<String>,
    behaviour: Behaviour,
}

impl ImageAgent {
    fn new(name: &str, images: &[&str], behaviour: Behaviour) -> Self {
        Self {
            name: name.to_string(),
            images: images.iter().map(|s| format!("aws:images:prod:us-east-1:{}", s)).collect(),
            behaviour,
        }
    }
}

#[async_trait]
impl CachingAgent for ImageAgent {
    fn agent_type(&self) -> &str {
        &self.name
    }

    fn provider_name(&self) -> &str {
        "aws"
    }

    fn provided_data_types(&self) -> Vec<AgentDataType> {
        vec![AgentDataType::authoritative("images", SCOPE)]
    }

    async fn load_data(&self, _cache: &ProviderCache) -> Result<CacheResult> {
        match self.behaviour {
            Behaviour::Succeed => {}
            Behaviour::FailMidway => {
                return Err(CacheError::upstream(&self.name, "page 2 of DescribeImages failed"));
            }
            Behaviour::Hang => tokio::time::sleep(Duration::from_secs(30)).await,
        }

        let mut result = CacheResult::new().with_namespace("images");
        for image in &self.images {
            result.add("images", CacheData::new(image.clone()));
        }
        Ok(result)
    }
}

async fn seeded_cache(config: CacheConfig) -> Arc<ProviderCache> {
    let cache = Arc::new(ProviderCache::in_memory(config).unwrap());
    let agent = ImageAgent::new("seed", &["ami-1", "ami-2"], Behaviour::Succeed);
    let outcome = AgentExecution::new(cache.clone()).run(&agent).await;
    assert!(outcome.is_success());
    cache
}

#[tokio::test]
async fn test_failed_poll_merges_nothing() {
    let cache = seeded_cache(CacheConfig::default()).await;

    let agent = ImageAgent::new("broken", &[], Behaviour::FailMidway);
    let outcome = AgentExecution::new(cache.clone()).run(&agent).await;

    assert!(!outcome.is_success());
    assert!(outcome.report().is_none());
    assert!(matches!(outcome.result, Err(CacheError::UpstreamPoll { .. })));
    assert_eq!(cache.get_identifiers("images").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_timed_out_poll_merges_nothing() {
    let config = CacheConfig::builder()
        .agent_timeout(Duration::from_millis(50))
        .build();
    let cache = seeded_cache(config).await;

    let agent = ImageAgent::new("slow", &[], Behaviour::Hang);
    let outcome = AgentExecution::new(cache.clone()).run(&agent).await;

    assert!(matches!(outcome.result, Err(CacheError::Timeout { .. })));
    assert!(outcome.duration < Duration::from_secs(30));
    assert_eq!(cache.get_identifiers("images").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_successful_run_reports_merge() {
    let cache = seeded_cache(CacheConfig::default()).await;

    let agent = ImageAgent::new("images", &["ami-2", "ami-3"], Behaviour::Succeed);
    let outcome = AgentExecution::new(cache.clone()).run(&agent).await;

    let report = outcome.report().unwrap();
    assert_eq!(report.agent_type, "images");
    assert_eq!(report.total_written(), 1);
    assert_eq!(report.total_skipped(), 1);
    assert_eq!(report.total_evicted(), 1);

    let ids = cache.get_identifiers("images").await.unwrap();
    assert!(ids.contains("aws:images:prod:us-east-1:ami-3"));
    assert!(!ids.contains("aws:images:prod:us-east-1:ami-1"));
}

#[tokio::test]
async fn test_registry_refuses_second_authority() {
    let mut registry = AgentRegistry::new();
    registry
        .register(Arc::new(ImageAgent::new("east-images", &[], Behaviour::Succeed)))
        .unwrap();

    let err = registry
        .register(Arc::new(ImageAgent::new("east-images-2", &[], Behaviour::Succeed)))
        .unwrap_err();
    assert!(matches!(err, CacheError::AuthorityConflict { .. }));
    assert_eq!(registry.len(), 1);
}

/// Store whose `merge_all` reports a conflict a fixed number of times
struct ContendedStore {
    inner: InMemoryCacheStore,
    conflicts_left: AtomicUsize,
    merges: AtomicUsize,
}

impl ContendedStore {
    fn new(conflicts: usize) -> Self {
        Self {
            inner: InMemoryCacheStore::new(CacheConfig::default()),
            conflicts_left: AtomicUsize::new(conflicts),
            merges: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CacheStore for ContendedStore {
    fn name(&self) -> &str {
        "contended"
    }

    async fn get_identifiers(&self, namespace: &str) -> Result<BTreeSet<String>> {
        self.inner.get_identifiers(namespace).await
    }

    async fn filter_identifiers(&self, namespace: &str, glob: &Glob) -> Result<BTreeSet<String>> {
        self.inner.filter_identifiers(namespace, glob).await
    }

    async fn get_all(
        &self,
        namespace: &str,
        keys: &[String],
        filter: &RelationshipFilter,
    ) -> Result<Vec<CacheData>> {
        self.inner.get_all(namespace, keys, filter).await
    }

    async fn merge_all(&self, namespace: &str, items: &[CacheData]) -> Result<MergeOutcome> {
        self.merges.fetch_add(1, Ordering::SeqCst);
        let conflicted = self
            .conflicts_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if conflicted {
            return Err(CacheError::MergeConflict {
                namespace: namespace.to_string(),
                scope: "*".to_string(),
            });
        }
        self.inner.merge_all(namespace, items).await
    }

    async fn evict_all(&self, namespace: &str, keys: &[String]) -> Result<Vec<String>> {
        self.inner.evict_all(namespace, keys).await
    }

    async fn references_to(&self, key: &str) -> Result<References> {
        self.inner.references_to(key).await
    }

    async fn namespaces(&self) -> Result<Vec<String>> {
        self.inner.namespaces().await
    }

    async fn cleanup_expired(&self) -> Result<Vec<InvalidationEvent>> {
        self.inner.cleanup_expired().await
    }

    async fn stats(&self) -> Result<CacheStats> {
        self.inner.stats().await
    }
}

#[tokio::test]
async fn test_merge_conflict_is_retried() {
    let store = Arc::new(ContendedStore::new(2));
    let config = CacheConfig::builder().merge_retry_attempts(3).build();
    let cache = Arc::new(ProviderCache::new(store.clone(), config).unwrap());

    let agent = ImageAgent::new("images", &["ami-1"], Behaviour::Succeed);
    let outcome = AgentExecution::new(cache.clone()).run(&agent).await;

    assert!(outcome.is_success());
    assert_eq!(store.merges.load(Ordering::SeqCst), 3);
    assert_eq!(cache.get_identifiers("images").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_merge_conflict_gives_up_after_retries() {
    let store = Arc::new(ContendedStore::new(10));
    let config = CacheConfig::builder().merge_retry_attempts(2).build();
    let cache = Arc::new(ProviderCache::new(store.clone(), config).unwrap());

    let agent = ImageAgent::new("images", &["ami-1"], Behaviour::Succeed);
    let outcome = AgentExecution::new(cache.clone()).run(&agent).await;

    assert!(matches!(
        outcome.result,
        Err(CacheError::MergeConflict { ref namespace, ref scope })
            if namespace == "images" && scope == SCOPE
    ));
    assert_eq!(store.merges.load(Ordering::SeqCst), 3);
    assert!(cache.get_identifiers("images").await.unwrap().is_empty());
}
