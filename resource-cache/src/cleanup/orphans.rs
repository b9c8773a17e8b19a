//! Cross-namespace orphan sweep
//!
//! A dependent entry (a cluster) exists only while some owner entry (a
//! server group) implies it. The sweep lists both namespaces, derives the
//! dependent key from every owner key and evicts dependents nothing derived.

use crate::cleanup::{CleanupAgent, CleanupReport};
use crate::error::{CacheError, Result};
use crate::invalidation::{InvalidationEvent, InvalidationReason};
use crate::key::{namespaces, CacheKey, KeyCodec, SEPARATOR};
use crate::provider::ProviderCache;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Maps a decoded owner key to the dependent key it keeps alive
pub type DeriveFn = dyn Fn(&KeyCodec, &CacheKey) -> Option<String> + Send + Sync;

/// Evicts dependent entries that no owner entry implies
pub struct OrphanSweepAgent {
    agent_type: String,
    codec: Arc<KeyCodec>,
    dependent_namespace: String,
    dependent_scope: String,
    owner_namespace: String,
    owner_scope: String,
    derive: Arc<DeriveFn>,
    dry_run: bool,
}

impl fmt::Debug for OrphanSweepAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrphanSweepAgent")
            .field("agent_type", &self.agent_type)
            .field("dependent_namespace", &self.dependent_namespace)
            .field("dependent_scope", &self.dependent_scope)
            .field("owner_namespace", &self.owner_namespace)
            .field("owner_scope", &self.owner_scope)
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

impl OrphanSweepAgent {
    /// Build a sweep over arbitrary namespaces
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent_type: impl Into<String>,
        codec: Arc<KeyCodec>,
        dependent_namespace: impl Into<String>,
        dependent_scope: impl Into<String>,
        owner_namespace: impl Into<String>,
        owner_scope: impl Into<String>,
        derive: Arc<DeriveFn>,
    ) -> Self {
        Self {
            agent_type: agent_type.into(),
            codec,
            dependent_namespace: dependent_namespace.into(),
            dependent_scope: dependent_scope.into(),
            owner_namespace: owner_namespace.into(),
            owner_scope: owner_scope.into(),
            derive,
            dry_run: false,
        }
    }

    /// Clusters of `provider` with no remaining server group
    ///
    /// `<p>:serverGroups:<cluster>:<account>:<region>:<serverGroup>` keeps
    /// `<p>:clusters:<application>:<account>:<cluster>` alive, where the
    /// application is the cluster name up to its first `-`.
    pub fn clusters_without_server_groups(provider: &str, codec: Arc<KeyCodec>) -> Self {
        let provider_name = provider.to_string();
        let derive = move |codec: &KeyCodec, key: &CacheKey| -> Option<String> {
            let cluster = key.field("cluster")?;
            let account = key.field("account")?;
            let application = cluster.split('-').next().unwrap_or(cluster);
            codec
                .encode(&provider_name, namespaces::CLUSTERS, &[application, account, cluster])
                .ok()
        };

        Self::new(
            format!("{}/ClustersWithoutServerGroupsSweep", provider),
            codec,
            namespaces::CLUSTERS,
            format!("{}{}{}{}*", provider, SEPARATOR, namespaces::CLUSTERS, SEPARATOR),
            namespaces::SERVER_GROUPS,
            format!("{}{}{}{}*", provider, SEPARATOR, namespaces::SERVER_GROUPS, SEPARATOR),
            Arc::new(derive),
        )
    }

    /// Report orphans without evicting them
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Namespace this sweep evicts from
    pub fn dependent_namespace(&self) -> &str {
        &self.dependent_namespace
    }
}

#[async_trait]
impl CleanupAgent for OrphanSweepAgent {
    fn agent_type(&self) -> &str {
        &self.agent_type
    }

    async fn run(&self, cache: &ProviderCache) -> Result<CleanupReport> {
        let mut report = CleanupReport::new(&self.agent_type, self.dry_run);

        let mut candidates = cache
            .filter_identifiers(&self.dependent_namespace, &self.dependent_scope)
            .await?;
        report.examined = candidates.len();

        let owners = cache
            .filter_identifiers(&self.owner_namespace, &self.owner_scope)
            .await?;

        for owner in &owners {
            match self.codec.decode(owner) {
                Ok(key) => {
                    if let Some(dependent) = (self.derive)(&self.codec, &key) {
                        candidates.remove(&dependent);
                    }
                }
                Err(CacheError::MalformedKey { reason, .. }) => {
                    debug!("Skipping undecodable {} key {}: {}", self.owner_namespace, owner, reason);
                    report.skipped_malformed += 1;
                }
                Err(e) => return Err(e),
            }
        }

        report.orphans = candidates.into_iter().collect();
        if report.orphans.is_empty() {
            debug!("{}: no orphans in {}", self.agent_type, self.dependent_namespace);
            return Ok(report);
        }

        if self.dry_run {
            info!(
                "{} (dry run): {} orphaned {} entries",
                self.agent_type,
                report.orphans.len(),
                self.dependent_namespace
            );
            return Ok(report);
        }

        report.removed = cache
            .evict_batched(&self.dependent_namespace, &report.orphans)
            .await?;
        info!(
            "{}: evicted {} orphaned {} entries",
            self.agent_type,
            report.removed.len(),
            self.dependent_namespace
        );
        report.events.push(InvalidationEvent::new(
            InvalidationReason::Orphaned {
                sweep: self.agent_type.clone(),
            },
            self.dependent_namespace.clone(),
            report.removed.clone(),
        ));

        Ok(report)
    }
}
