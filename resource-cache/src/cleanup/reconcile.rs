//! Reconciliation against an external system of record
//!
//! Some systems keep their own records about cached entities (tags,
//! annotations, ownership). When the entity is gone from the cache the
//! external record is an orphan. This agent finds those records and deletes
//! them, sparing any changed within `min_age` because the cache may simply
//! not have caught up yet.

use crate::cleanup::{CleanupAgent, CleanupReport};
use crate::error::Result;
use crate::invalidation::{InvalidationEvent, InvalidationReason};
use crate::key::Glob;
use crate::provider::ProviderCache;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A record held by the external system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalRecord {
    /// Id within the external system
    pub id: String,

    /// Kind of entity the record is about
    pub entity_type: String,

    /// Cache key of the entity the record refers to
    pub entity_ref: String,

    /// Last modification in the external system
    pub last_modified: DateTime<Utc>,
}

/// An external store of records that refer to cached entities
#[async_trait]
pub trait SystemOfRecord: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Every record the system holds
    async fn list_all_records(&self) -> Result<Vec<ExternalRecord>>;

    /// Delete one record
    async fn delete_record(&self, id: &str) -> Result<()>;
}

/// Settings for one reconciliation agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    /// Only records of this entity type are considered
    pub entity_type: String,

    /// Cache namespace the references point into
    pub namespace: String,

    /// Only references matching this glob are considered
    pub scope: String,

    /// Records modified more recently than this are never deleted
    pub min_age: Duration,

    /// Report orphans without deleting them
    pub dry_run: bool,
}

impl ReconciliationConfig {
    /// Config with a one hour age guard, dry run off
    pub fn new(entity_type: impl Into<String>, namespace: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            namespace: namespace.into(),
            scope: scope.into(),
            min_age: Duration::from_secs(3600),
            dry_run: false,
        }
    }

    /// Set the age guard
    pub fn with_min_age(mut self, min_age: Duration) -> Self {
        self.min_age = min_age;
        self
    }

    /// Set dry run
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// Deletes external records whose cached entity no longer exists
pub struct ReconciliationAgent {
    agent_type: String,
    system: Arc<dyn SystemOfRecord>,
    config: ReconciliationConfig,
}

impl ReconciliationAgent {
    /// Create an agent over a system of record
    pub fn new(agent_type: impl Into<String>, system: Arc<dyn SystemOfRecord>, config: ReconciliationConfig) -> Self {
        Self {
            agent_type: agent_type.into(),
            system,
            config,
        }
    }

    /// Agent settings
    pub fn config(&self) -> &ReconciliationConfig {
        &self.config
    }

    /// Run with an explicit notion of "now" for the age guard
    pub async fn run_at(&self, cache: &ProviderCache, now: DateTime<Utc>) -> Result<CleanupReport> {
        let config = &self.config;
        let mut report = CleanupReport::new(&self.agent_type, config.dry_run);
        let scope = Glob::new(&config.scope)?;

        let records: Vec<ExternalRecord> = self
            .system
            .list_all_records()
            .await?
            .into_iter()
            .filter(|r| r.entity_type == config.entity_type && scope.matches(&r.entity_ref))
            .collect();
        report.examined = records.len();

        let known = cache.store().filter_identifiers(&config.namespace, &scope).await?;
        let min_age = chrono::Duration::from_std(config.min_age).unwrap_or_else(|_| chrono::Duration::days(36_500));

        let mut removed_refs = Vec::new();
        for record in records {
            if known.contains(&record.entity_ref) {
                continue;
            }
            if now - record.last_modified < min_age {
                debug!(
                    "Sparing {} record {} modified at {}",
                    self.system.name(),
                    record.id,
                    record.last_modified
                );
                report.skipped_recent += 1;
                continue;
            }

            report.orphans.push(record.id.clone());
            if config.dry_run {
                continue;
            }

            match self.system.delete_record(&record.id).await {
                Ok(()) => {
                    report.removed.push(record.id);
                    removed_refs.push(record.entity_ref);
                }
                Err(e) => {
                    warn!(
                        "Failed to delete {} record {} for {}: {}",
                        self.system.name(),
                        record.id,
                        record.entity_ref,
                        e
                    );
                    report.failed += 1;
                }
            }
        }

        if !removed_refs.is_empty() {
            report.events.push(
                InvalidationEvent::new(InvalidationReason::Reconciled, config.namespace.clone(), removed_refs)
                    .with_context(format!("deleted from {}", self.system.name())),
            );
        }

        info!(
            "{}{}: {} orphaned {} records, {} deleted, {} spared as recent, {} failed",
            self.agent_type,
            if config.dry_run { " (dry run)" } else { "" },
            report.orphans.len(),
            config.entity_type,
            report.removed.len(),
            report.skipped_recent,
            report.failed
        );
        Ok(report)
    }
}

#[async_trait]
impl CleanupAgent for ReconciliationAgent {
    fn agent_type(&self) -> &str {
        &self.agent_type
    }

    async fn run(&self, cache: &ProviderCache) -> Result<CleanupReport> {
        self.run_at(cache, Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::error::CacheError;
    use tokio::sync::Mutex;

    struct Records {
        records: Mutex<Vec<ExternalRecord>>,
        refuse: Option<String>,
    }

    #[async_trait]
    impl SystemOfRecord for Records {
        fn name(&self) -> &str {
            "tags"
        }

        async fn list_all_records(&self) -> Result<Vec<ExternalRecord>> {
            Ok(self.records.lock().await.clone())
        }

        async fn delete_record(&self, id: &str) -> Result<()> {
            if self.refuse.as_deref() == Some(id) {
                return Err(CacheError::Other("permission denied".to_string()));
            }
            self.records.lock().await.retain(|r| r.id != id);
            Ok(())
        }
    }

    fn record(id: &str, entity_type: &str, entity_ref: &str) -> ExternalRecord {
        ExternalRecord {
            id: id.to_string(),
            entity_type: entity_type.to_string(),
            entity_ref: entity_ref.to_string(),
            last_modified: Utc::now() - chrono::Duration::days(2),
        }
    }

    #[tokio::test]
    async fn test_filters_type_and_scope_and_counts_failures() {
        let cache = ProviderCache::in_memory(CacheConfig::default()).unwrap();
        let system = Arc::new(Records {
            records: Mutex::new(vec![
                record("t1", "serverGroup", "aws:serverGroups:a:prod:us-east-1:a-v001"),
                record("t2", "serverGroup", "aws:serverGroups:b:prod:us-east-1:b-v001"),
                record("t3", "cluster", "aws:serverGroups:c:prod:us-east-1:c-v001"),
                record("t4", "serverGroup", "gce:serverGroups:d:prod:us-east1:d-v001"),
            ]),
            refuse: Some("t2".to_string()),
        });

        let agent = ReconciliationAgent::new(
            "tag-reconciler",
            system.clone(),
            ReconciliationConfig::new("serverGroup", "serverGroups", "aws:serverGroups:*"),
        );

        let report = agent.run(&cache).await.unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.orphans.len(), 2);
        assert_eq!(report.removed, vec!["t1".to_string()]);
        assert_eq!(report.failed, 1);
        assert_eq!(system.records.lock().await.len(), 3);
    }
}
