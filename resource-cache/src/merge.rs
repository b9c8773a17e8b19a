//! Authoritative/informative merge of one agent run
//!
//! For each authoritative (namespace, scope) declared by the agent, the
//! engine holds that scope's lock while it reads the keys currently stored
//! in the scope, upserts the new records and evicts whatever the new result
//! no longer contains. Informative namespaces only upsert. Explicit
//! evictions from the result run last.

use crate::agent::{AgentDataType, Authority};
use crate::data::CacheData;
use crate::error::{CacheError, Result};
use crate::invalidation::{InvalidationEvent, InvalidationReason};
use crate::key::Glob;
use crate::provider::ProviderCache;
use crate::result::CacheResult;
use crate::store::MergeOutcome;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// Per-namespace counts for one merge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NamespaceReport {
    /// Records inserted or changed
    pub written: usize,

    /// Records skipped as unchanged
    pub skipped: usize,

    /// Keys removed, by diff or explicit eviction
    pub evicted: usize,

    /// Records written outside every authoritative scope of the namespace
    pub out_of_scope: usize,
}

impl NamespaceReport {
    fn absorb(&mut self, outcome: MergeOutcome) {
        self.written += outcome.written;
        self.skipped += outcome.skipped;
    }
}

/// What one `put_cache_result` did
#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    /// Agent whose result was merged
    pub agent_type: String,

    /// Counts by namespace
    pub namespaces: BTreeMap<String, NamespaceReport>,

    /// Removals, one event per namespace and cause
    pub events: Vec<InvalidationEvent>,
}

impl MergeReport {
    fn new(agent_type: &str) -> Self {
        Self {
            agent_type: agent_type.to_string(),
            ..Default::default()
        }
    }

    fn namespace(&mut self, namespace: &str) -> &mut NamespaceReport {
        self.namespaces.entry(namespace.to_string()).or_default()
    }

    /// Records written across all namespaces
    pub fn total_written(&self) -> usize {
        self.namespaces.values().map(|n| n.written).sum()
    }

    /// Records skipped across all namespaces
    pub fn total_skipped(&self) -> usize {
        self.namespaces.values().map(|n| n.skipped).sum()
    }

    /// Keys evicted across all namespaces
    pub fn total_evicted(&self) -> usize {
        self.namespaces.values().map(|n| n.evicted).sum()
    }

    /// Keys evicted from one namespace, across all events
    pub fn evicted_keys(&self, namespace: &str) -> BTreeSet<&str> {
        self.events
            .iter()
            .filter(|event| event.namespace == namespace)
            .flat_map(|event| event.keys.iter().map(String::as_str))
            .collect()
    }
}

/// An authoritative scope and the records it will write
struct ScopeWork<'a> {
    data_type: &'a AgentDataType,
    glob: Glob,
    items: Vec<CacheData>,
}

/// Authoritative scopes of one namespace and every key the agent submitted to it
#[derive(Default)]
struct NamespaceWork<'a> {
    scopes: Vec<ScopeWork<'a>>,
    fresh: BTreeSet<String>,
}

pub(crate) async fn merge_result(
    cache: &ProviderCache,
    agent_type: &str,
    data_types: &[AgentDataType],
    result: CacheResult,
) -> Result<MergeReport> {
    let CacheResult {
        mut cache_results,
        evictions,
    } = result;
    let mut report = MergeReport::new(agent_type);

    // Authoritative scopes grouped by namespace, in declaration order
    let mut scopes: BTreeMap<&str, NamespaceWork<'_>> = BTreeMap::new();
    for data_type in data_types.iter().filter(|dt| dt.authority == Authority::Authoritative) {
        scopes.entry(data_type.namespace.as_str()).or_default().scopes.push(ScopeWork {
            data_type,
            glob: Glob::new(data_type.scope())?,
            items: Vec::new(),
        });
    }

    for (namespace, ns_work) in scopes.iter_mut() {
        // Absent from the result means the scope is now empty
        let items = cache_results.remove(*namespace).unwrap_or_default();
        let mut out_of_scope = 0;
        for item in items {
            ns_work.fresh.insert(item.id.clone());
            match ns_work.scopes.iter().position(|work| work.glob.matches(&item.id)) {
                Some(i) => ns_work.scopes[i].items.push(item),
                None => {
                    warn!(
                        "Agent {} wrote {} outside its authoritative scope of {}",
                        agent_type, item.id, namespace
                    );
                    out_of_scope += 1;
                    ns_work.scopes[0].items.push(item);
                }
            }
        }
        report.namespace(namespace).out_of_scope += out_of_scope;
    }

    // A key submitted under any scope of the namespace is never stale in another
    for (namespace, ns_work) in &scopes {
        for work in &ns_work.scopes {
            let (outcome, evicted) = merge_scope_with_retry(cache, agent_type, work, &ns_work.fresh).await?;
            let ns_report = report.namespace(namespace);
            ns_report.absorb(outcome);
            ns_report.evicted += evicted.len();

            if !evicted.is_empty() {
                report.events.push(
                    InvalidationEvent::new(
                        InvalidationReason::Authoritative {
                            agent: agent_type.to_string(),
                        },
                        *namespace,
                        evicted,
                    )
                    .with_context(format!("scope {}", work.glob)),
                );
            }
        }
    }

    // Informative namespaces and anything the agent did not declare
    let declared: HashMap<&str, Authority> = data_types
        .iter()
        .map(|dt| (dt.namespace.as_str(), dt.authority))
        .collect();
    for (namespace, items) in cache_results {
        if !declared.contains_key(namespace.as_str()) {
            debug!(
                "Agent {} wrote undeclared namespace {}; merging informatively",
                agent_type, namespace
            );
        }
        let outcome = upsert(cache, &namespace, &items).await?;
        report.namespace(&namespace).absorb(outcome);
    }

    for (namespace, keys) in evictions {
        if keys.is_empty() {
            continue;
        }
        let evicted = cache.evict_batched(&namespace, &keys).await?;
        report.namespace(&namespace).evicted += evicted.len();
        if !evicted.is_empty() {
            report.events.push(InvalidationEvent::new(
                InvalidationReason::Explicit,
                namespace,
                evicted,
            ));
        }
    }

    info!(
        "Merged result of {}: {} written, {} unchanged, {} evicted",
        agent_type,
        report.total_written(),
        report.total_skipped(),
        report.total_evicted()
    );
    Ok(report)
}

async fn merge_scope_with_retry(
    cache: &ProviderCache,
    agent_type: &str,
    work: &ScopeWork<'_>,
    fresh: &BTreeSet<String>,
) -> Result<(MergeOutcome, Vec<String>)> {
    let namespace = work.data_type.namespace.as_str();
    let scope = work.glob.as_str();
    let max_retries = cache.config().merge_retry_attempts;
    let mut attempt = 0;

    loop {
        let guard = cache.locks().lock(namespace, scope).await;
        let result = merge_scope(cache, namespace, &work.glob, &work.items, fresh).await;
        drop(guard);

        match result {
            Ok(merged) => return Ok(merged),
            Err(e) if e.is_retryable() && attempt < max_retries => {
                attempt += 1;
                warn!(
                    "Merge conflict for {} in {} ({}), retrying from a fresh read ({}/{})",
                    agent_type, namespace, scope, attempt, max_retries
                );
            }
            Err(e) if e.is_retryable() => {
                return Err(CacheError::MergeConflict {
                    namespace: namespace.to_string(),
                    scope: scope.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }
}

/// Read, upsert, diff-evict for one scope; caller holds the scope lock
async fn merge_scope(
    cache: &ProviderCache,
    namespace: &str,
    glob: &Glob,
    items: &[CacheData],
    fresh: &BTreeSet<String>,
) -> Result<(MergeOutcome, Vec<String>)> {
    let existing = cache.store().filter_identifiers(namespace, glob).await?;
    let outcome = upsert(cache, namespace, items).await?;

    let stale: Vec<String> = existing
        .into_iter()
        .filter(|key| !fresh.contains(key))
        .collect();

    let evicted = if stale.is_empty() {
        Vec::new()
    } else {
        debug!("Evicting {} stale keys from {} ({})", stale.len(), namespace, glob);
        cache.evict_batched(namespace, &stale).await?
    };
    Ok((outcome, evicted))
}

async fn upsert(cache: &ProviderCache, namespace: &str, items: &[CacheData]) -> Result<MergeOutcome> {
    let mut outcome = MergeOutcome::default();
    for batch in items.chunks(cache.config().max_merge_batch_size) {
        outcome.absorb(cache.store().merge_all(namespace, batch).await?);
    }
    Ok(outcome)
}
