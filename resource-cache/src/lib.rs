//! # Resource Cache
//!
//! A namespaced cache of live cloud resources, written by many independent
//! polling agents and read by lookups, safety checks and UIs.
//!
//! ## Features
//!
//! - Colon-separated keys with per-namespace schemas and glob queries
//! - Authoritative merges: an agent's result is the complete view of its
//!   scope, so anything missing from it is evicted
//! - Informative merges that only add or refresh
//! - A relationship graph between records, readable in both directions
//! - Cleanup agents for cross-namespace orphans and external records
//! - Swappable backing stores: in-memory or Neo4j
//!
//! ## Writing
//!
//! Agents return a [`CacheResult`]; [`AgentExecution`] polls them and hands
//! the result to the merge engine with the data types they declared.
//!
//! ```no_run
//! use resource_cache::{
//!     AgentDataType, CacheConfig, CacheData, CacheResult, ProviderCache,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = ProviderCache::in_memory(CacheConfig::default())?;
//!
//!     let result = CacheResult::new().with(
//!         "serverGroups",
//!         CacheData::new("aws:serverGroups:app-main:prod:us-east-1:app-main-v001")
//!             .with_attribute("desiredCapacity", 3)
//!             .with_relationship("clusters", "aws:clusters:app:prod:app-main"),
//!     );
//!
//!     let data_types = [AgentDataType::authoritative(
//!         "serverGroups",
//!         "aws:serverGroups:*:prod:us-east-1:*",
//!     )];
//!     let report = cache
//!         .put_cache_result("aws/prod/us-east-1/ServerGroups", &data_types, result)
//!         .await?;
//!     println!("{} written", report.total_written());
//!     Ok(())
//! }
//! ```
//!
//! ## Reading
//!
//! ```no_run
//! use resource_cache::{CacheConfig, ProviderCache, RelationshipFilter};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = ProviderCache::in_memory(CacheConfig::default())?;
//!
//!     let keys = cache
//!         .filter_identifiers("serverGroups", "aws:serverGroups:myapp-*:prod:*")
//!         .await?;
//!     for key in keys {
//!         if let Some(sg) = cache
//!             .get("serverGroups", &key, &RelationshipFilter::include(["clusters"]))
//!             .await?
//!         {
//!             println!("{} -> {:?}", sg.id, sg.relationships);
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Neo4j backing
//!
//! ```no_run
//! use resource_cache::{CacheConfig, Neo4jCacheStore, Neo4jStoreConfig, ProviderCache};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = CacheConfig::from_env()?;
//!     let store = Neo4jCacheStore::connect(&Neo4jStoreConfig::from_env(), config.clone()).await?;
//!
//!     let health = store.client().health_check_with_retry().await;
//!     println!("Neo4j: {:?}", health.status);
//!
//!     let _cache = ProviderCache::new(Arc::new(store), config)?;
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod cleanup;
pub mod config;
pub mod data;
pub mod error;
pub mod filter;
pub mod invalidation;
pub mod key;
pub mod locks;
pub mod merge;
pub mod provider;
pub mod relationships;
pub mod result;
pub mod stats;
pub mod store;

// Re-export main types for convenience
pub use agent::{AgentDataType, AgentExecution, AgentRegistry, AgentRunOutcome, Authority, CachingAgent};
pub use cleanup::{
    CleanupAgent, CleanupReport, ExternalRecord, OrphanSweepAgent, ReconciliationAgent,
    ReconciliationConfig, SystemOfRecord,
};
pub use config::{CacheConfig, CacheConfigBuilder};
pub use data::{Attributes, CacheData, Relationships};
pub use error::{CacheError, Result};
pub use filter::RelationshipFilter;
pub use invalidation::{InvalidationEvent, InvalidationReason};
pub use key::{namespaces, CacheKey, Glob, KeyCodec, KeySchema};
pub use merge::{MergeReport, NamespaceReport};
pub use provider::ProviderCache;
pub use relationships::{References, RelationshipIndex};
pub use result::CacheResult;
pub use stats::CacheStats;
pub use store::{
    CacheStore, InMemoryCacheStore, MergeOutcome, Neo4jCacheStore, Neo4jClient, Neo4jStoreConfig,
};
