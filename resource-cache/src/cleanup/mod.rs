//! Agents that remove what no single caching agent can
//!
//! Caching agents only see their own scope. Cleanup agents look across
//! namespaces (orphan sweeps) or across systems (reconciliation against an
//! external system of record) and evict the leftovers. They are expected to
//! run after the primary agents of a cycle have merged.

pub mod orphans;
pub mod reconcile;

pub use orphans::OrphanSweepAgent;
pub use reconcile::{ExternalRecord, ReconciliationAgent, ReconciliationConfig, SystemOfRecord};

use crate::error::Result;
use crate::invalidation::InvalidationEvent;
use crate::provider::ProviderCache;
use async_trait::async_trait;
use serde::Serialize;

/// What a cleanup run found and did
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    /// Agent that produced the report
    pub agent_type: String,

    /// Nothing was removed
    pub dry_run: bool,

    /// Entries examined
    pub examined: usize,

    /// Entries identified as orphaned
    pub orphans: Vec<String>,

    /// Orphans actually removed
    pub removed: Vec<String>,

    /// Keys that could not be decoded
    pub skipped_malformed: usize,

    /// Orphans spared because they changed too recently
    pub skipped_recent: usize,

    /// Removals that failed
    pub failed: usize,

    /// Removal events
    #[serde(skip)]
    pub events: Vec<InvalidationEvent>,
}

impl CleanupReport {
    /// Empty report for an agent
    pub fn new(agent_type: impl Into<String>, dry_run: bool) -> Self {
        Self {
            agent_type: agent_type.into(),
            dry_run,
            ..Default::default()
        }
    }
}

/// An agent that evicts cache entries no caching agent owns anymore
#[async_trait]
pub trait CleanupAgent: Send + Sync {
    /// Unique name
    fn agent_type(&self) -> &str;

    /// Examine the cache and remove orphans
    async fn run(&self, cache: &ProviderCache) -> Result<CleanupReport>;
}
