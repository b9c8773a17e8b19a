//! Per-run output of a caching agent

use crate::data::CacheData;
use std::collections::BTreeMap;

/// Records to upsert and keys to evict, grouped by namespace
///
/// Built fresh on every agent run and consumed by the merge engine.
#[derive(Debug, Clone, Default)]
pub struct CacheResult {
    /// namespace -> records to upsert
    pub cache_results: BTreeMap<String, Vec<CacheData>>,

    /// namespace -> keys to evict explicitly
    pub evictions: BTreeMap<String, Vec<String>>,
}

impl CacheResult {
    /// Create an empty result
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record to upsert
    pub fn add(&mut self, namespace: impl Into<String>, data: CacheData) -> &mut Self {
        self.cache_results.entry(namespace.into()).or_default().push(data);
        self
    }

    /// Builder-style [`add`](Self::add)
    pub fn with(mut self, namespace: impl Into<String>, data: CacheData) -> Self {
        self.add(namespace, data);
        self
    }

    /// Declare a namespace as present even when it has no records
    ///
    /// For an authoritative namespace this means "the scope is now empty".
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.cache_results.entry(namespace.into()).or_default();
        self
    }

    /// Request explicit eviction of a key
    pub fn evict(&mut self, namespace: impl Into<String>, key: impl Into<String>) -> &mut Self {
        self.evictions.entry(namespace.into()).or_default().push(key.into());
        self
    }

    /// Builder-style [`evict`](Self::evict)
    pub fn with_eviction(mut self, namespace: impl Into<String>, key: impl Into<String>) -> Self {
        self.evict(namespace, key);
        self
    }

    /// Records for one namespace
    pub fn items(&self, namespace: &str) -> &[CacheData] {
        self.cache_results
            .get(namespace)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Total number of records to upsert
    pub fn item_count(&self) -> usize {
        self.cache_results.values().map(Vec::len).sum()
    }

    /// True when there is nothing to upsert or evict
    pub fn is_empty(&self) -> bool {
        self.item_count() == 0 && self.evictions.values().all(Vec::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_result() {
        let result = CacheResult::new()
            .with("serverGroups", CacheData::new("aws:serverGroups:a:prod:us-east-1:a-v001"))
            .with("serverGroups", CacheData::new("aws:serverGroups:a:prod:us-east-1:a-v002"))
            .with_namespace("clusters")
            .with_eviction("instances", "aws:instances:prod:us-east-1:i-1");

        assert_eq!(result.item_count(), 2);
        assert_eq!(result.items("serverGroups").len(), 2);
        assert!(result.items("clusters").is_empty());
        assert!(result.cache_results.contains_key("clusters"));
        assert!(result.items("missing").is_empty());
        assert!(!result.is_empty());
    }

    #[test]
    fn test_empty_result() {
        let result = CacheResult::new().with_namespace("clusters");
        assert!(result.is_empty());
    }
}
