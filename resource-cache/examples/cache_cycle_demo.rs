//! Cache Cycle Demo
//!
//! Runs two polling cycles of a pair of simulated caching agents against an
//! in-memory cache, then a cluster orphan sweep.
//!
//! Usage:
//!   cargo run --example cache_cycle_demo
//!
//! Set RUST_LOG=resource_cache=debug for per-record logging.

use async_trait::async_trait;
use resource_cache::{
    AgentDataType, AgentExecution, AgentRegistry, CacheConfig, CacheData, CacheResult,
    CachingAgent, CleanupAgent, KeyCodec, OrphanSweepAgent, ProviderCache, RelationshipFilter,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Pretends to page through a region's auto scaling groups
struct ServerGroupAgent {
    name: String,
    region: String,
    cycle: AtomicUsize,
}

impl ServerGroupAgent {
    fn new(region: &str) -> Self {
        Self {
            name: format!("aws/prod/{}/ServerGroupCachingAgent", region),
            region: region.to_string(),
            cycle: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CachingAgent for ServerGroupAgent {
    fn agent_type(&self) -> &str {
        &self.name
    }

    fn provider_name(&self) -> &str {
        "aws"
    }

    fn provided_data_types(&self) -> Vec<AgentDataType> {
        vec![
            AgentDataType::authoritative(
                "serverGroups",
                format!("aws:serverGroups:*:prod:{}:*", self.region),
            ),
            AgentDataType::informative("clusters"),
        ]
    }

    async fn load_data(&self, _cache: &ProviderCache) -> resource_cache::Result<CacheResult> {
        let cycle = self.cycle.fetch_add(1, Ordering::SeqCst);

        // The canary is torn down after the first cycle
        let mut clusters = vec!["shop-main"];
        if cycle == 0 {
            clusters.push("shop-canary");
        }

        let mut result = CacheResult::new().with_namespace("serverGroups");
        for cluster in clusters {
            let cluster_key = format!("aws:clusters:shop:prod:{}", cluster);
            let sg_key = format!("aws:serverGroups:{}:prod:{}:{}-v001", cluster, self.region, cluster);
            result.add(
                "serverGroups",
                CacheData::new(sg_key.clone())
                    .with_attribute("desiredCapacity", 2)
                    .with_attribute("region", self.region.clone())
                    .with_relationship("clusters", cluster_key.clone()),
            );
            result.add(
                "clusters",
                CacheData::new(cluster_key).with_relationship("serverGroups", sg_key),
            );
        }
        Ok(result)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("=== Resource Cache Cycle Demo ===");

    let cache = Arc::new(ProviderCache::in_memory(CacheConfig::from_env()?)?);
    let execution = AgentExecution::new(cache.clone());

    let mut registry = AgentRegistry::new();
    registry.register(Arc::new(ServerGroupAgent::new("us-east-1")))?;
    registry.register(Arc::new(ServerGroupAgent::new("eu-west-1")))?;

    let sweep = OrphanSweepAgent::clusters_without_server_groups("aws", Arc::new(KeyCodec::standard("aws")));

    for cycle in 1..=2 {
        info!("\n--- Cycle {} ---", cycle);
        for outcome in execution.run_all(&registry).await {
            match outcome.report() {
                Some(report) => info!(
                    "{} ({}): {} written, {} unchanged, {} evicted in {:?}",
                    outcome.agent_type,
                    outcome.run_id,
                    report.total_written(),
                    report.total_skipped(),
                    report.total_evicted(),
                    outcome.duration
                ),
                None => info!("{} failed: {:?}", outcome.agent_type, outcome.result.as_ref().err()),
            }
        }

        let report = sweep.run(&cache).await?;
        info!("Sweep removed {:?}", report.removed);
    }

    info!("\n--- Final state ---");
    for cluster in cache
        .get_all_matching("clusters", "aws:clusters:*", &RelationshipFilter::include(["serverGroups"]))
        .await?
    {
        info!("{} <- {:?}", cluster.id, cluster.relationships.get("serverGroups"));
    }
    info!("{}", cache.stats().await?);

    Ok(())
}
