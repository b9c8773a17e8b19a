//! Graph-backed cache store on Neo4j
//!
//! Layout:
//!
//! ```text
//! (:CacheEntry {namespace, id, `attr:<name>`, hash, ttl_seconds, expires_at, created_at, updated_at})
//!     -[:RELATES_TO {namespace}]->(:CacheRef {id})
//! ```
//!
//! Attributes are one JSON-encoded property each, so a write overwrites only
//! the fields it carries. Relationship targets are `CacheRef` nodes keyed by
//! the target key; unions are `MERGE`s and reverse lookups match on the ref.
//! Each record is written by a single statement, which keeps records whole
//! for concurrent readers. Timestamps are epoch milliseconds.

pub mod connection;

pub use connection::{HealthCheckConfig, HealthCheckMethod, HealthCheckResult, HealthStatus, Neo4jClient};

use crate::config::CacheConfig;
use crate::data::{Attributes, CacheData, Relationships};
use crate::error::{CacheError, Result};
use crate::filter::RelationshipFilter;
use crate::invalidation::{InvalidationEvent, InvalidationReason};
use crate::key::Glob;
use crate::relationships::References;
use crate::stats::CacheStats;
use crate::store::{CacheStore, MergeOutcome};
use async_trait::async_trait;
use chrono::Utc;
use neo4rs::{query, Query};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Prefix of attribute properties on `CacheEntry` nodes
const ATTR_PREFIX: &str = "attr:";

/// Separator used to pack pairs into single strings in query results
const PAIR_SEP: &str = "\u{1f}";

const LIVE: &str = "(e.expires_at IS NULL OR e.expires_at > $now)";

/// Connection settings for the Neo4j store
#[derive(Debug, Clone)]
pub struct Neo4jStoreConfig {
    /// Bolt URI, e.g. `bolt://localhost:7687`
    pub uri: String,
    /// Username for authentication
    pub user: String,
    /// Password for authentication
    pub password: String,
    /// Database name
    pub database: String,
    /// Rows fetched per round trip
    pub fetch_size: usize,
    /// Connection pool size
    pub max_connections: usize,
    /// Health check behaviour
    pub health: HealthCheckConfig,
}

impl Default for Neo4jStoreConfig {
    fn default() -> Self {
        Self {
            uri: "bolt://localhost:7687".to_string(),
            user: "neo4j".to_string(),
            password: "password".to_string(),
            database: "neo4j".to_string(),
            fetch_size: 500,
            max_connections: 16,
            health: HealthCheckConfig::default(),
        }
    }
}

impl Neo4jStoreConfig {
    /// Read `NEO4J_URI`, `NEO4J_USER`, `NEO4J_PASSWORD` and `NEO4J_DATABASE`
    ///
    /// A `.env` file is loaded first if present; unset variables keep their
    /// defaults.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            uri: lookup("NEO4J_URI").unwrap_or(defaults.uri),
            user: lookup("NEO4J_USER").unwrap_or(defaults.user),
            password: lookup("NEO4J_PASSWORD").unwrap_or(defaults.password),
            database: lookup("NEO4J_DATABASE").unwrap_or(defaults.database),
            ..defaults
        }
    }
}

/// Cache store persisted in Neo4j
pub struct Neo4jCacheStore {
    client: Neo4jClient,
    config: CacheConfig,
    stats: RwLock<CacheStats>,
}

impl Neo4jCacheStore {
    /// Connect and make sure constraints exist
    pub async fn connect(store_config: &Neo4jStoreConfig, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let client = Neo4jClient::connect(store_config).await?;
        let store = Self {
            client,
            config,
            stats: RwLock::new(CacheStats::default()),
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// The underlying client, for health checks
    pub fn client(&self) -> &Neo4jClient {
        &self.client
    }

    /// Create constraints and indexes used by the store's queries
    pub async fn ensure_schema(&self) -> Result<()> {
        let statements = [
            "CREATE CONSTRAINT cache_entry_key IF NOT EXISTS FOR (e:CacheEntry) REQUIRE (e.namespace, e.id) IS UNIQUE",
            "CREATE CONSTRAINT cache_ref_id IF NOT EXISTS FOR (r:CacheRef) REQUIRE r.id IS UNIQUE",
            "CREATE INDEX cache_entry_namespace IF NOT EXISTS FOR (e:CacheEntry) ON (e.namespace)",
        ];
        for statement in statements {
            self.client
                .run(query(statement))
                .await
                .map_err(|e| CacheError::QueryError(format!("schema setup failed: {}", e)))?;
        }
        info!("Neo4j cache schema ready");
        Ok(())
    }

    /// Delete every record and reference node
    pub async fn clear(&self) -> Result<()> {
        self.client
            .run(query("MATCH (n) WHERE n:CacheEntry OR n:CacheRef DETACH DELETE n"))
            .await
    }

    async fn ids_from(&self, q: Query) -> Result<BTreeSet<String>> {
        let rows = self.client.rows(q).await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get::<String>("id").ok())
            .collect())
    }

    /// Existing write hashes for live records
    async fn write_hashes(&self, namespace: &str, ids: Vec<String>, now: i64) -> Result<HashMap<String, String>> {
        let q = query(&format!(
            "UNWIND $ids AS id \
             MATCH (e:CacheEntry {{namespace: $namespace, id: id}}) WHERE {LIVE} \
             RETURN e.id AS id, coalesce(e.hash, '') AS hash"
        ))
        .param("ids", ids)
        .param("namespace", namespace)
        .param("now", now);

        let rows = self.client.rows(q).await?;
        Ok(rows
            .iter()
            .filter_map(|row| Some((row.get::<String>("id").ok()?, row.get::<String>("hash").ok()?)))
            .collect())
    }

    /// Delete records whose TTL elapsed among `ids` before they are rewritten
    async fn purge_expired(&self, namespace: &str, ids: Vec<String>, now: i64) -> Result<usize> {
        let q = query(
            "UNWIND $ids AS id \
             MATCH (e:CacheEntry {namespace: $namespace, id: id}) \
             WHERE e.expires_at IS NOT NULL AND e.expires_at <= $now \
             RETURN e.id AS id",
        )
        .param("ids", ids)
        .param("namespace", namespace)
        .param("now", now);

        let expired: Vec<String> = self.ids_from(q).await?.into_iter().collect();
        if expired.is_empty() {
            return Ok(0);
        }
        Ok(self.delete(namespace, expired).await?.len())
    }

    async fn delete(&self, namespace: &str, ids: Vec<String>) -> Result<Vec<String>> {
        let q = query(
            "UNWIND $ids AS id \
             MATCH (e:CacheEntry {namespace: $namespace, id: id}) \
             OPTIONAL MATCH (src:CacheEntry)-[:RELATES_TO]->(r:CacheRef {id: id}) \
             SET src.hash = null \
             WITH e, id, collect(DISTINCT r) AS refs \
             FOREACH (r IN refs | DETACH DELETE r) \
             DETACH DELETE e \
             RETURN id",
        )
        .param("ids", ids)
        .param("namespace", namespace);

        Ok(self.ids_from(q).await?.into_iter().collect())
    }

    async fn write_record(&self, namespace: &str, item: &CacheData, hash: &str, now: i64) -> Result<()> {
        let ttl = self.config.effective_ttl(item.ttl_seconds);
        let q = build_write(namespace, item, hash, now, ttl.map(|t| now + t.as_millis() as i64))?;
        self.client.run(q).await
    }

    async fn touch(&self, namespace: &str, id: &str, expires_at: i64) -> Result<()> {
        let q = query("MATCH (e:CacheEntry {namespace: $namespace, id: $id}) SET e.expires_at = $expires_at")
            .param("namespace", namespace)
            .param("id", id)
            .param("expires_at", expires_at);
        self.client.run(q).await
    }
}

/// Build the single statement that upserts one record
fn build_write(
    namespace: &str,
    item: &CacheData,
    hash: &str,
    now: i64,
    expires_at: Option<i64>,
) -> Result<Query> {
    let mut sets = vec![
        "e.updated_at = $now".to_string(),
        "e.hash = $hash".to_string(),
    ];
    let mut attr_values = Vec::with_capacity(item.attributes.len());
    for (i, (name, value)) in item.attributes.iter().enumerate() {
        sets.push(format!("e.{} = $a{}", property_name(name), i));
        attr_values.push(serde_json::to_string(value)?);
    }
    if expires_at.is_some() {
        sets.push("e.expires_at = $expires_at".to_string());
    }
    if item.ttl_seconds.is_some() {
        sets.push("e.ttl_seconds = $ttl_seconds".to_string());
    }

    let (rel_namespaces, rel_keys): (Vec<String>, Vec<String>) = item
        .relationships
        .iter()
        .flat_map(|(ns, keys)| keys.iter().map(move |key| (ns.clone(), key.clone())))
        .unzip();

    let statement = format!(
        "MERGE (e:CacheEntry {{namespace: $namespace, id: $id}}) \
         ON CREATE SET e.created_at = $now \
         SET {} \
         WITH e \
         UNWIND range(0, size($rel_keys) - 1) AS i \
         MERGE (r:CacheRef {{id: $rel_keys[i]}}) \
         MERGE (e)-[:RELATES_TO {{namespace: $rel_namespaces[i]}}]->(r)",
        sets.join(", ")
    );

    let mut q = query(&statement)
        .param("namespace", namespace)
        .param("id", item.id.as_str())
        .param("now", now)
        .param("hash", hash)
        .param("rel_keys", rel_keys)
        .param("rel_namespaces", rel_namespaces);
    for (i, value) in attr_values.into_iter().enumerate() {
        q = q.param(&format!("a{}", i), value);
    }
    if let Some(expires_at) = expires_at {
        q = q.param("expires_at", expires_at);
    }
    if let Some(ttl) = item.ttl_seconds {
        q = q.param("ttl_seconds", ttl as i64);
    }
    Ok(q)
}

/// Backtick-quoted attribute property name
fn property_name(attribute: &str) -> String {
    format!("`{}{}`", ATTR_PREFIX, attribute.replace('`', "``"))
}

fn split_pair(packed: &str) -> Option<(&str, &str)> {
    packed.split_once(PAIR_SEP)
}

fn decode_attributes(packed: &[String]) -> Result<Attributes> {
    let mut attributes = Attributes::new();
    for pair in packed {
        if let Some((name, json)) = split_pair(pair) {
            attributes.insert(name.to_string(), serde_json::from_str(json)?);
        }
    }
    Ok(attributes)
}

fn collect_pairs(packed: &[String], filter: &RelationshipFilter, into: &mut Relationships) {
    for pair in packed {
        if let Some((ns, key)) = split_pair(pair) {
            if filter.includes(ns) {
                into.entry(ns.to_string()).or_default().insert(key.to_string());
            }
        }
    }
}

#[async_trait]
impl CacheStore for Neo4jCacheStore {
    fn name(&self) -> &str {
        "neo4j"
    }

    async fn get_identifiers(&self, namespace: &str) -> Result<BTreeSet<String>> {
        let q = query(&format!(
            "MATCH (e:CacheEntry {{namespace: $namespace}}) WHERE {LIVE} RETURN e.id AS id"
        ))
        .param("namespace", namespace)
        .param("now", Utc::now().timestamp_millis());
        self.ids_from(q).await
    }

    async fn filter_identifiers(&self, namespace: &str, glob: &Glob) -> Result<BTreeSet<String>> {
        let q = query(&format!(
            "MATCH (e:CacheEntry {{namespace: $namespace}}) WHERE {LIVE} AND e.id =~ $pattern RETURN e.id AS id"
        ))
        .param("namespace", namespace)
        .param("pattern", glob.to_regex_source())
        .param("now", Utc::now().timestamp_millis());
        self.ids_from(q).await
    }

    async fn get_all(
        &self,
        namespace: &str,
        keys: &[String],
        filter: &RelationshipFilter,
    ) -> Result<Vec<CacheData>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let q = query(&format!(
            "UNWIND $ids AS id \
             MATCH (e:CacheEntry {{namespace: $namespace, id: id}}) WHERE {LIVE} \
             OPTIONAL MATCH (e)-[fr:RELATES_TO]->(fref:CacheRef) \
             WITH e, collect(fr.namespace + $sep + fref.id) AS forward \
             OPTIONAL MATCH (src:CacheEntry)-[:RELATES_TO]->(:CacheRef {{id: e.id}}) \
             WHERE src.expires_at IS NULL OR src.expires_at > $now \
             WITH e, forward, collect(DISTINCT src.namespace + $sep + src.id) AS reverse \
             RETURN e.id AS id, \
                    [k IN keys(e) WHERE k STARTS WITH $prefix | substring(k, size($prefix)) + $sep + e[k]] AS attributes, \
                    forward, reverse, e.ttl_seconds AS ttl_seconds"
        ))
        .param("ids", keys.to_vec())
        .param("namespace", namespace)
        .param("now", Utc::now().timestamp_millis())
        .param("sep", PAIR_SEP)
        .param("prefix", ATTR_PREFIX);

        let rows = self.client.rows(q).await?;
        let mut found = Vec::with_capacity(rows.len());
        for row in &rows {
            let Ok(id) = row.get::<String>("id") else {
                continue;
            };
            let attributes = decode_attributes(&row.get::<Vec<String>>("attributes").unwrap_or_default())?;

            let mut relationships = Relationships::new();
            if !filter.is_none() {
                collect_pairs(&row.get::<Vec<String>>("forward").unwrap_or_default(), filter, &mut relationships);
                collect_pairs(&row.get::<Vec<String>>("reverse").unwrap_or_default(), filter, &mut relationships);
            }

            found.push(CacheData {
                id,
                attributes,
                relationships,
                ttl_seconds: row.get::<i64>("ttl_seconds").ok().map(|t| t.max(0) as u64),
            });
        }

        let mut stats = self.stats.write().await;
        stats.hits += found.len() as u64;
        stats.misses += (keys.len() - found.len()) as u64;

        Ok(found)
    }

    async fn merge_all(&self, namespace: &str, items: &[CacheData]) -> Result<MergeOutcome> {
        if items.is_empty() {
            return Ok(MergeOutcome::default());
        }

        let now = Utc::now().timestamp_millis();
        let ids: Vec<String> = items.iter().map(|item| item.id.clone()).collect();

        let purged = self.purge_expired(namespace, ids.clone(), now).await?;
        let previous = if self.config.hashing_enabled {
            self.write_hashes(namespace, ids, now).await?
        } else {
            HashMap::new()
        };

        let mut outcome = MergeOutcome::default();
        for item in items {
            let hash = if self.config.hashing_enabled {
                item.content_hash()?
            } else {
                String::new()
            };

            if !hash.is_empty() && previous.get(&item.id) == Some(&hash) {
                debug!("Skipping unchanged write: {}", item.id);
                if let Some(ttl) = self.config.effective_ttl(item.ttl_seconds) {
                    self.touch(namespace, &item.id, now + ttl.as_millis() as i64).await?;
                }
                outcome.skipped += 1;
                continue;
            }

            self.write_record(namespace, item, &hash, now)
                .await
                .map_err(|e| match e {
                    CacheError::MergeConflict { .. } => CacheError::MergeConflict {
                        namespace: namespace.to_string(),
                        scope: item.id.clone(),
                    },
                    other => other,
                })?;
            outcome.written += 1;
        }

        let mut stats = self.stats.write().await;
        stats.items_merged += outcome.written as u64;
        stats.writes_skipped += outcome.skipped as u64;
        stats.expirations += purged as u64;

        Ok(outcome)
    }

    async fn evict_all(&self, namespace: &str, keys: &[String]) -> Result<Vec<String>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let evicted = self.delete(namespace, keys.to_vec()).await?;
        self.stats.write().await.evictions += evicted.len() as u64;
        if !evicted.is_empty() {
            debug!("Evicted {} entries from {}", evicted.len(), namespace);
        }
        Ok(evicted)
    }

    async fn references_to(&self, key: &str) -> Result<References> {
        let q = query(&format!(
            "MATCH (e:CacheEntry)-[:RELATES_TO]->(:CacheRef {{id: $id}}) WHERE {LIVE} \
             RETURN DISTINCT e.namespace AS namespace, e.id AS id"
        ))
        .param("id", key)
        .param("now", Utc::now().timestamp_millis());

        let mut refs = References::new();
        for row in self.client.rows(q).await? {
            if let (Ok(namespace), Ok(id)) = (row.get::<String>("namespace"), row.get::<String>("id")) {
                refs.entry(namespace).or_default().insert(id);
            }
        }
        Ok(refs)
    }

    async fn namespaces(&self) -> Result<Vec<String>> {
        let rows = self
            .client
            .rows(query(
                "MATCH (e:CacheEntry) RETURN DISTINCT e.namespace AS namespace ORDER BY namespace",
            ))
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get::<String>("namespace").ok())
            .collect())
    }

    async fn cleanup_expired(&self) -> Result<Vec<InvalidationEvent>> {
        let q = query(
            "MATCH (e:CacheEntry) WHERE e.expires_at IS NOT NULL AND e.expires_at <= $now \
             RETURN e.namespace AS namespace, e.id AS id",
        )
        .param("now", Utc::now().timestamp_millis());

        let mut expired: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for row in self.client.rows(q).await? {
            if let (Ok(namespace), Ok(id)) = (row.get::<String>("namespace"), row.get::<String>("id")) {
                expired.entry(namespace).or_default().push(id);
            }
        }

        let mut events = Vec::new();
        for (namespace, ids) in expired {
            let removed = self.delete(&namespace, ids).await?;
            if removed.is_empty() {
                continue;
            }
            self.stats.write().await.expirations += removed.len() as u64;
            debug!("Cleaned up {} expired entries in {}", removed.len(), namespace);
            events.push(InvalidationEvent::new(InvalidationReason::Expired, namespace, removed));
        }

        // Reference nodes left without any incoming edge
        self.client
            .run(query("MATCH (r:CacheRef) WHERE NOT ()-[:RELATES_TO]->(r) DELETE r"))
            .await?;

        Ok(events)
    }

    async fn stats(&self) -> Result<CacheStats> {
        let mut stats = self.stats.read().await.clone();

        if self.config.enable_metrics {
            let rows = self
                .client
                .rows(query("MATCH (e:CacheEntry) RETURN count(e) AS entries"))
                .await?;
            if let Some(row) = rows.first() {
                stats.entries = row.get::<i64>("entries").unwrap_or(0).max(0) as usize;
            }
        }
        Ok(stats)
    }
}
