//! Neo4j connection management for the graph-backed store
//!
//! Wraps a pooled `neo4rs::Graph` with query helpers that translate driver
//! failures into [`CacheError`]s, and with the health checks operators use
//! to decide whether the store is reachable.

use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use neo4rs::{query, ConfigBuilder, Graph, Query, Row};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::Neo4jStoreConfig;

/// Configuration for health check behavior
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Health check method to use
    pub method: HealthCheckMethod,
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Delay between retry attempts
    pub retry_delay: Duration,
    /// Whether to fall back from db.ping() to RETURN 1
    pub enable_fallback: bool,
    /// Response time threshold for degraded state (in milliseconds)
    pub degraded_threshold_ms: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            method: HealthCheckMethod::Ping,
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            enable_fallback: true,
            degraded_threshold_ms: 1000,
        }
    }
}

/// Health check method variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckMethod {
    /// `RETURN 1`
    Simple,
    /// `CALL db.ping()` (Neo4j 4.1+)
    Ping,
}

/// Health status enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Database is healthy and responsive
    Healthy,
    /// Database is responsive but slow (above degraded threshold)
    Degraded,
    /// Database is not responsive or erroring
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy or degraded (operational)
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

/// Outcome of a health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// Overall health status
    pub status: HealthStatus,
    /// Response time in milliseconds
    pub response_time_ms: u64,
    /// Method that produced the status
    pub method: HealthCheckMethod,
    /// Retries made before this result
    pub retry_count: u32,
    /// Whether the ping fell back to `RETURN 1`
    pub used_fallback: bool,
    /// Timestamp of the health check
    pub timestamp: DateTime<Utc>,
    /// Error message (if unhealthy)
    pub error: Option<String>,
}

impl HealthCheckResult {
    fn responded(elapsed: Duration, method: HealthCheckMethod, degraded_threshold_ms: u64) -> Self {
        let response_time_ms = elapsed.as_millis() as u64;
        let status = if response_time_ms > degraded_threshold_ms {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        Self {
            status,
            response_time_ms,
            method,
            retry_count: 0,
            used_fallback: false,
            timestamp: Utc::now(),
            error: None,
        }
    }

    fn failed(elapsed: Duration, method: HealthCheckMethod, error: String) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            response_time_ms: elapsed.as_millis() as u64,
            method,
            retry_count: 0,
            used_fallback: false,
            timestamp: Utc::now(),
            error: Some(error),
        }
    }
}

/// Pooled Neo4j client used by [`Neo4jCacheStore`](super::Neo4jCacheStore)
pub struct Neo4jClient {
    graph: Graph,
    health_config: HealthCheckConfig,
}

impl Neo4jClient {
    /// Connect using a store configuration
    pub async fn connect(config: &Neo4jStoreConfig) -> Result<Self> {
        info!(
            "Connecting to Neo4j at {} (database: {})",
            config.uri, config.database
        );

        let driver_config = ConfigBuilder::default()
            .uri(config.uri.as_str())
            .user(config.user.as_str())
            .password(config.password.as_str())
            .db(config.database.as_str())
            .fetch_size(config.fetch_size)
            .max_connections(config.max_connections)
            .build()
            .map_err(|e| CacheError::ConfigError(e.to_string()))?;

        let graph = Graph::connect(driver_config)
            .await
            .map_err(|e| CacheError::ConnectionError(e.to_string()))?;

        info!("Successfully connected to Neo4j");

        Ok(Self {
            graph,
            health_config: config.health.clone(),
        })
    }

    /// Run a statement that returns nothing
    pub async fn run(&self, q: Query) -> Result<()> {
        self.graph.run(q).await.map_err(classify)
    }

    /// Run a statement and collect all rows
    pub async fn rows(&self, q: Query) -> Result<Vec<Row>> {
        let mut stream = self.graph.execute(q).await.map_err(classify)?;
        let mut rows = Vec::new();
        while let Some(row) = stream.next().await.map_err(classify)? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Simple health check using RETURN 1
    pub async fn health_check(&self) -> Result<bool> {
        debug!("Executing simple health check (RETURN 1)");

        self.graph
            .run(query("RETURN 1"))
            .await
            .map_err(|e| CacheError::ConnectionError(e.to_string()))?;

        Ok(true)
    }

    /// Standard health check using CALL db.ping()
    pub async fn health_check_ping(&self) -> Result<HealthStatus> {
        debug!("Executing standard health check (CALL db.ping())");

        let rows = self.rows(query("CALL db.ping()")).await?;
        match rows.first() {
            Some(row) => {
                let success: bool = row.get("success").unwrap_or(false);
                if success {
                    Ok(HealthStatus::Healthy)
                } else {
                    warn!("Standard health check returned success=false");
                    Ok(HealthStatus::Unhealthy)
                }
            }
            None => {
                error!("Standard health check returned no results");
                Err(CacheError::QueryError(
                    "No result returned from db.ping()".to_string(),
                ))
            }
        }
    }

    /// Health check with the configured method, retries and fallback
    ///
    /// Never fails; an unreachable database yields an `Unhealthy` result.
    pub async fn health_check_with_retry(&self) -> HealthCheckResult {
        let config = &self.health_config;
        let mut retry_count = 0;
        let mut used_fallback = false;

        loop {
            let start = Instant::now();

            let mut result = match (config.method, used_fallback) {
                (HealthCheckMethod::Ping, false) => match self.health_check_ping().await {
                    Ok(status) => {
                        let mut result = HealthCheckResult::responded(
                            start.elapsed(),
                            HealthCheckMethod::Ping,
                            config.degraded_threshold_ms,
                        );
                        if !status.is_operational() {
                            result.status = status;
                        }
                        result
                    }
                    Err(e) if config.enable_fallback => {
                        warn!("db.ping() failed, falling back to RETURN 1: {}", e);
                        used_fallback = true;
                        self.simple_result(start).await
                    }
                    Err(e) => {
                        HealthCheckResult::failed(start.elapsed(), HealthCheckMethod::Ping, e.to_string())
                    }
                },
                _ => self.simple_result(start).await,
            };

            result.retry_count = retry_count;
            result.used_fallback = used_fallback;

            if result.status.is_operational() || retry_count >= config.max_retries {
                return result;
            }

            retry_count += 1;
            warn!(
                "Health check failed (attempt {}/{}), retrying after {:?}",
                retry_count,
                config.max_retries + 1,
                config.retry_delay
            );
            tokio::time::sleep(config.retry_delay).await;
        }
    }

    async fn simple_result(&self, start: Instant) -> HealthCheckResult {
        match self.health_check().await {
            Ok(_) => HealthCheckResult::responded(
                start.elapsed(),
                HealthCheckMethod::Simple,
                self.health_config.degraded_threshold_ms,
            ),
            Err(e) => HealthCheckResult::failed(start.elapsed(), HealthCheckMethod::Simple, e.to_string()),
        }
    }

    /// Get a reference to the underlying Neo4j Graph instance
    pub fn graph(&self) -> &Graph {
        &self.graph
    }
}

/// Map a driver error, surfacing write contention as a retryable conflict
pub(crate) fn classify(e: neo4rs::Error) -> CacheError {
    let message = e.to_string();
    if is_contention(&message) {
        debug!("Write contention reported by Neo4j: {}", message);
        CacheError::MergeConflict {
            namespace: String::new(),
            scope: String::new(),
        }
    } else {
        CacheError::DriverError(e)
    }
}

fn is_contention(message: &str) -> bool {
    message.contains("ConstraintValidationFailed")
        || message.contains("DeadlockDetected")
        || message.contains("LockClient")
}
