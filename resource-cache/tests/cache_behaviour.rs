//! Integration tests for merge semantics over the in-memory store
//!
//! These tests exercise the provider cache end to end:
//! - Authoritative diff-eviction and completeness per scope
//! - Informative writes never removing anything
//! - Idempotent re-merges and unchanged-write skipping
//! - Relationship symmetry and eviction cleanup
//! - Glob queries and TTL expiry

use resource_cache::{
    AgentDataType, CacheConfig, CacheData, CacheResult, InvalidationReason, ProviderCache,
    RelationshipFilter,
};
use serde_json::json;
use std::collections::BTreeSet;
use std::time::Duration;

const EAST_SCOPE: &str = "aws:serverGroups:*:*:us-east-1:*";
const EAST_AGENT: &str = "aws/prod/us-east-1/ServerGroupCachingAgent";

fn cache() -> ProviderCache {
    ProviderCache::in_memory(
        CacheConfig::builder()
            .ttl_jitter(0.0)
            .enable_auto_cleanup(false)
            .build(),
    )
    .unwrap()
}

fn server_group(name: &str, capacity: u64) -> CacheData {
    CacheData::new(format!("aws:serverGroups:myapp:prod:us-east-1:{}", name))
        .with_attribute("desiredCapacity", capacity)
        .with_relationship("clusters", "aws:clusters:myapp:prod:myapp")
}

fn east_result(groups: Vec<CacheData>) -> CacheResult {
    let mut result = CacheResult::new().with_namespace("serverGroups");
    for group in groups {
        result.add("serverGroups", group);
    }
    result
}

fn east_types() -> Vec<AgentDataType> {
    vec![AgentDataType::authoritative("serverGroups", EAST_SCOPE)]
}

fn keys(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_authoritative_replacement_scenario() {
    let cache = cache();

    let r1 = east_result(vec![server_group("sg-1", 1), server_group("sg-2", 2)]);
    let report = cache.put_cache_result(EAST_AGENT, &east_types(), r1).await.unwrap();
    assert_eq!(report.total_written(), 2);
    assert_eq!(
        cache.filter_identifiers("serverGroups", EAST_SCOPE).await.unwrap(),
        keys(&[
            "aws:serverGroups:myapp:prod:us-east-1:sg-1",
            "aws:serverGroups:myapp:prod:us-east-1:sg-2",
        ])
    );

    let r2 = east_result(vec![server_group("sg-2", 5), server_group("sg-3", 3)]);
    let report = cache.put_cache_result(EAST_AGENT, &east_types(), r2).await.unwrap();
    assert_eq!(report.total_evicted(), 1);
    assert_eq!(
        report.evicted_keys("serverGroups"),
        BTreeSet::from(["aws:serverGroups:myapp:prod:us-east-1:sg-1"])
    );
    assert!(matches!(
        report.events[0].reason,
        InvalidationReason::Authoritative { ref agent } if agent == EAST_AGENT
    ));

    assert_eq!(
        cache.filter_identifiers("serverGroups", EAST_SCOPE).await.unwrap(),
        keys(&[
            "aws:serverGroups:myapp:prod:us-east-1:sg-2",
            "aws:serverGroups:myapp:prod:us-east-1:sg-3",
        ])
    );

    let sg2 = cache
        .get(
            "serverGroups",
            "aws:serverGroups:myapp:prod:us-east-1:sg-2",
            &RelationshipFilter::None,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sg2.attribute("desiredCapacity"), Some(&json!(5)));
}

#[tokio::test]
async fn test_authoritative_scopes_are_independent() {
    let cache = cache();
    let west_scope = "aws:serverGroups:*:*:us-west-2:*";

    cache
        .put_cache_result(
            "aws/prod/us-west-2/ServerGroupCachingAgent",
            &[AgentDataType::authoritative("serverGroups", west_scope)],
            CacheResult::new().with(
                "serverGroups",
                CacheData::new("aws:serverGroups:myapp:prod:us-west-2:sg-9"),
            ),
        )
        .await
        .unwrap();

    // An empty east result clears east only
    cache
        .put_cache_result(EAST_AGENT, &east_types(), east_result(vec![server_group("sg-1", 1)]))
        .await
        .unwrap();
    cache
        .put_cache_result(EAST_AGENT, &east_types(), CacheResult::new())
        .await
        .unwrap();

    assert!(cache.filter_identifiers("serverGroups", EAST_SCOPE).await.unwrap().is_empty());
    assert_eq!(
        cache.filter_identifiers("serverGroups", west_scope).await.unwrap(),
        keys(&["aws:serverGroups:myapp:prod:us-west-2:sg-9"])
    );
}

#[tokio::test]
async fn test_merge_is_idempotent() {
    let cache = cache();
    let groups = vec![server_group("sg-1", 1), server_group("sg-2", 2)];

    cache
        .put_cache_result(EAST_AGENT, &east_types(), east_result(groups.clone()))
        .await
        .unwrap();
    let before = cache
        .get_all_matching("serverGroups", EAST_SCOPE, &RelationshipFilter::All)
        .await
        .unwrap();

    let report = cache
        .put_cache_result(EAST_AGENT, &east_types(), east_result(groups))
        .await
        .unwrap();
    assert_eq!(report.total_written(), 0);
    assert_eq!(report.total_skipped(), 2);
    assert_eq!(report.total_evicted(), 0);

    let after = cache
        .get_all_matching("serverGroups", EAST_SCOPE, &RelationshipFilter::All)
        .await
        .unwrap();
    assert_eq!(before, after);

    let stats = cache.stats().await.unwrap();
    assert_eq!(stats.items_merged, 2);
    assert_eq!(stats.writes_skipped, 2);
}

#[tokio::test]
async fn test_informative_merge_never_removes() {
    let cache = cache();
    cache
        .put_cache_result(
            EAST_AGENT,
            &east_types(),
            east_result(vec![server_group("sg-1", 1), server_group("sg-2", 2)]),
        )
        .await
        .unwrap();

    let report = cache
        .put_cache_result(
            "aws/LaunchConfigEnricher",
            &[AgentDataType::informative("serverGroups")],
            CacheResult::new().with(
                "serverGroups",
                CacheData::new("aws:serverGroups:myapp:prod:us-east-1:sg-1")
                    .with_attribute("launchConfig", "lc-1"),
            ),
        )
        .await
        .unwrap();
    assert_eq!(report.total_evicted(), 0);

    assert_eq!(cache.get_identifiers("serverGroups").await.unwrap().len(), 2);

    // Attributes merge per field
    let sg1 = cache
        .get(
            "serverGroups",
            "aws:serverGroups:myapp:prod:us-east-1:sg-1",
            &RelationshipFilter::None,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sg1.attribute("launchConfig"), Some(&json!("lc-1")));
    assert_eq!(sg1.attribute("desiredCapacity"), Some(&json!(1)));
}

#[tokio::test]
async fn test_relationship_symmetry_survives_unrelated_merge() {
    let cache = cache();
    let cluster = "aws:clusters:myapp:prod:myapp";
    let sg = "aws:serverGroups:myapp:prod:us-east-1:sg-1";

    cache
        .put_cache_result(EAST_AGENT, &east_types(), east_result(vec![server_group("sg-1", 1)]))
        .await
        .unwrap();
    cache
        .put_cache_result(
            "aws/ClusterCachingAgent",
            &[AgentDataType::authoritative("clusters", "aws:clusters:*")],
            CacheResult::new().with("clusters", CacheData::new(cluster)),
        )
        .await
        .unwrap();

    let refs = cache.references_to(cluster, &RelationshipFilter::All).await.unwrap();
    assert_eq!(refs.get("serverGroups"), Some(&keys(&[sg])));

    // Reverse hydration on read
    let hydrated = cache
        .get("clusters", cluster, &RelationshipFilter::include(["serverGroups"]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(hydrated.related("serverGroups").collect::<Vec<_>>(), vec![sg]);

    cache
        .put_cache_result(
            "aws/ImageCachingAgent",
            &[AgentDataType::authoritative("images", "aws:images:*")],
            CacheResult::new().with("images", CacheData::new("aws:images:prod:us-east-1:ami-1")),
        )
        .await
        .unwrap();

    let refs = cache.references_to(cluster, &RelationshipFilter::All).await.unwrap();
    assert_eq!(refs.get("serverGroups"), Some(&keys(&[sg])));
}

#[tokio::test]
async fn test_eviction_strips_dangling_relationships() {
    let cache = cache();
    let cluster = "aws:clusters:myapp:prod:myapp";

    cache
        .put_cache_result(
            "aws/ClusterCachingAgent",
            &[AgentDataType::authoritative("clusters", "aws:clusters:*")],
            CacheResult::new().with(
                "clusters",
                CacheData::new(cluster)
                    .with_relationship("serverGroups", "aws:serverGroups:myapp:prod:us-east-1:sg-1"),
            ),
        )
        .await
        .unwrap();
    cache
        .put_cache_result(EAST_AGENT, &east_types(), east_result(vec![server_group("sg-1", 1)]))
        .await
        .unwrap();

    cache
        .put_cache_result(EAST_AGENT, &east_types(), CacheResult::new())
        .await
        .unwrap();

    let stored = cache
        .get("clusters", cluster, &RelationshipFilter::All)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.relationships.is_empty());
    assert!(cache
        .references_to(cluster, &RelationshipFilter::All)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_glob_query_matches_field_prefix() {
    let cache = cache();
    cache
        .store()
        .merge_all(
            "serverGroups",
            &[
                CacheData::new("aws:serverGroups:myapp-v001:prod:us-east-1"),
                CacheData::new("aws:serverGroups:myapp-v002:prod:eu-west-1"),
                CacheData::new("aws:serverGroups:otherapp-v001:prod:us-east-1"),
                CacheData::new("aws:serverGroups:myapp-v003:test:us-east-1"),
            ],
        )
        .await
        .unwrap();

    let found = cache
        .filter_identifiers("serverGroups", "aws:serverGroups:myapp-*:prod:*")
        .await
        .unwrap();
    assert_eq!(
        found,
        keys(&[
            "aws:serverGroups:myapp-v001:prod:us-east-1",
            "aws:serverGroups:myapp-v002:prod:eu-west-1",
        ])
    );

    // Case-sensitive
    assert!(cache
        .filter_identifiers("serverGroups", "aws:serverGroups:MYAPP-*")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_explicit_eviction_in_result() {
    let cache = cache();
    cache
        .store()
        .merge_all("images", &[CacheData::new("aws:images:prod:us-east-1:ami-1")])
        .await
        .unwrap();

    let result = CacheResult::new()
        .with("instances", CacheData::new("aws:instances:prod:us-east-1:i-1"))
        .with_eviction("images", "aws:images:prod:us-east-1:ami-1")
        .with_eviction("images", "aws:images:prod:us-east-1:ami-gone");

    let report = cache
        .put_cache_result("aws/InstanceCachingAgent", &[AgentDataType::informative("instances")], result)
        .await
        .unwrap();
    assert_eq!(report.namespaces["images"].evicted, 1);
    assert!(matches!(report.events[0].reason, InvalidationReason::Explicit));
    assert!(cache.get_identifiers("images").await.unwrap().is_empty());
    assert_eq!(cache.get_identifiers("instances").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_expired_records_disappear_and_are_swept() {
    let cache = cache();
    cache
        .put_cache_result(
            EAST_AGENT,
            &east_types(),
            east_result(vec![server_group("sg-1", 1).with_ttl(0), server_group("sg-2", 2)]),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(
        cache.filter_identifiers("serverGroups", EAST_SCOPE).await.unwrap(),
        keys(&["aws:serverGroups:myapp:prod:us-east-1:sg-2"])
    );

    let events = cache.cleanup_expired().await.unwrap();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0].reason, InvalidationReason::Expired));
    assert_eq!(cache.get_identifiers("serverGroups").await.unwrap().len(), 1);
}
