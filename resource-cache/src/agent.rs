//! Caching agents: the contract, the registry and one-shot execution
//!
//! An agent polls one slice of a cloud provider and returns a
//! [`CacheResult`]. It never writes to the cache directly; the execution
//! layer hands its result to the merge engine together with the data types
//! the agent declared. When agents run is decided elsewhere.

use crate::error::{CacheError, Result};
use crate::key::Glob;
use crate::merge::MergeReport;
use crate::provider::ProviderCache;
use crate::result::CacheResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Whether an agent's view of a namespace is complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Authority {
    /// The agent's result is the full truth for its scope; absence evicts
    Authoritative,

    /// The agent only adds or refreshes records
    Informative,
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authority::Authoritative => write!(f, "authoritative"),
            Authority::Informative => write!(f, "informative"),
        }
    }
}

/// A namespace an agent provides, with its authority and scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDataType {
    /// Target namespace
    pub namespace: String,

    /// Authority policy
    pub authority: Authority,

    /// Glob of the keys this agent is responsible for
    pub scope: Option<String>,
}

impl AgentDataType {
    /// Authoritative over the keys matching `scope`
    pub fn authoritative(namespace: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            authority: Authority::Authoritative,
            scope: Some(scope.into()),
        }
    }

    /// Informative writer of a namespace
    pub fn informative(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            authority: Authority::Informative,
            scope: None,
        }
    }

    /// Scope glob; the whole namespace when none was given
    pub fn scope(&self) -> &str {
        self.scope.as_deref().unwrap_or("*")
    }
}

/// A polling agent that discovers resources for one provider slice
#[async_trait]
pub trait CachingAgent: Send + Sync {
    /// Unique name, e.g. `aws/prod/us-east-1/ServerGroupCachingAgent`
    fn agent_type(&self) -> &str;

    /// Cloud provider id, the first key segment of everything it writes
    fn provider_name(&self) -> &str;

    /// Namespaces written, with authority and scope
    fn provided_data_types(&self) -> Vec<AgentDataType>;

    /// Enumerate upstream resources
    ///
    /// Must fail with [`CacheError::UpstreamPoll`] rather than return a
    /// partial result; a partial authoritative result would evict live
    /// resources.
    async fn load_data(&self, cache: &ProviderCache) -> Result<CacheResult>;
}

/// Registered agents and the authoritative scopes they own
#[derive(Default)]
pub struct AgentRegistry {
    agents: Vec<Arc<dyn CachingAgent>>,
    owners: HashMap<(String, String), String>,
}

impl AgentRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent, rejecting duplicate names and contested scopes
    pub fn register(&mut self, agent: Arc<dyn CachingAgent>) -> Result<()> {
        let agent_type = agent.agent_type().to_string();
        if self.get(&agent_type).is_some() {
            return Err(CacheError::ConfigError(format!(
                "agent {} is already registered",
                agent_type
            )));
        }

        let claims: Vec<(String, String)> = agent
            .provided_data_types()
            .into_iter()
            .filter(|dt| dt.authority == Authority::Authoritative)
            .map(|dt| (dt.namespace.clone(), dt.scope().to_string()))
            .collect();

        // Two owners of one key would evict each other's records every cycle
        for (namespace, scope) in &claims {
            let glob = Glob::new(scope)?;
            for ((owned_namespace, owned_scope), existing) in &self.owners {
                if owned_namespace != namespace {
                    continue;
                }
                if glob.overlaps(&Glob::new(owned_scope)?) {
                    return Err(CacheError::AuthorityConflict {
                        namespace: namespace.clone(),
                        scope: scope.clone(),
                        existing: existing.clone(),
                    });
                }
            }
        }

        for claim in claims {
            self.owners.insert(claim, agent_type.clone());
        }
        info!("Registered caching agent {}", agent_type);
        self.agents.push(agent);
        Ok(())
    }

    /// Remove an agent and release its scopes
    pub fn unregister(&mut self, agent_type: &str) -> bool {
        let before = self.agents.len();
        self.agents.retain(|agent| agent.agent_type() != agent_type);
        self.owners.retain(|_, owner| owner != agent_type);
        before != self.agents.len()
    }

    /// Look up an agent by name
    pub fn get(&self, agent_type: &str) -> Option<&Arc<dyn CachingAgent>> {
        self.agents.iter().find(|agent| agent.agent_type() == agent_type)
    }

    /// Current owner of an authoritative scope
    pub fn owner_of(&self, namespace: &str, scope: &str) -> Option<&str> {
        self.owners
            .get(&(namespace.to_string(), scope.to_string()))
            .map(String::as_str)
    }

    /// All registered agents
    pub fn agents(&self) -> &[Arc<dyn CachingAgent>] {
        &self.agents
    }

    /// Number of registered agents
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Check if no agents are registered
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// Result of one agent run
#[derive(Debug)]
pub struct AgentRunOutcome {
    /// Agent that ran
    pub agent_type: String,

    /// Correlates log lines of this run
    pub run_id: Uuid,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// Wall time of poll and merge
    pub duration: Duration,

    /// Merge report, or why nothing was merged
    pub result: Result<MergeReport>,
}

impl AgentRunOutcome {
    /// True when the result was merged
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// The merge report of a successful run
    pub fn report(&self) -> Option<&MergeReport> {
        self.result.as_ref().ok()
    }
}

/// Runs agents against a provider cache
pub struct AgentExecution {
    cache: Arc<ProviderCache>,
}

impl AgentExecution {
    /// Create an executor writing into `cache`
    pub fn new(cache: Arc<ProviderCache>) -> Self {
        Self { cache }
    }

    /// The cache runs merge into
    pub fn cache(&self) -> &Arc<ProviderCache> {
        &self.cache
    }

    /// Poll one agent and merge its result
    ///
    /// A failed or timed-out poll merges nothing.
    pub async fn run(&self, agent: &dyn CachingAgent) -> AgentRunOutcome {
        let agent_type = agent.agent_type().to_string();
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();

        let span = info_span!("agent_run", agent = %agent_type, run_id = %run_id);
        let result = self.poll_and_merge(agent).instrument(span).await;

        AgentRunOutcome {
            agent_type,
            run_id,
            started_at,
            duration: start.elapsed(),
            result,
        }
    }

    async fn poll_and_merge(&self, agent: &dyn CachingAgent) -> Result<MergeReport> {
        let agent_type = agent.agent_type();
        let timeout = self.cache.config().agent_timeout;

        let loaded = match tokio::time::timeout(timeout, agent.load_data(&self.cache)).await {
            Ok(loaded) => loaded,
            Err(_) => Err(CacheError::Timeout {
                timeout_seconds: timeout.as_secs(),
                context: format!("load_data of {}", agent_type),
            }),
        };

        let result = match loaded {
            Ok(result) => result,
            Err(e) => {
                warn!("Agent {} poll failed, nothing merged: {}", agent_type, e);
                return Err(e);
            }
        };

        let report = self
            .cache
            .put_cache_result(agent_type, &agent.provided_data_types(), result)
            .await;
        if let Err(e) = &report {
            warn!("Agent {} merge failed: {}", agent_type, e);
        }
        report
    }

    /// Run every registered agent concurrently
    pub async fn run_all(&self, registry: &AgentRegistry) -> Vec<AgentRunOutcome> {
        let runs = registry.agents().iter().map(|agent| self.run(agent.as_ref()));
        let outcomes = join_all(runs).await;

        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        info!(
            "Ran {} caching agents ({} failed)",
            outcomes.len(),
            failed
        );
        outcomes
    }
}
