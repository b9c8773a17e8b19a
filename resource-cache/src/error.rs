//! Error types for cache operations
//!
//! This module defines the error taxonomy for the resource cache: upstream
//! poll failures, malformed keys, merge conflicts, and backing-store errors.

use thiserror::Error;

/// Main error type for cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    /// The agent could not enumerate its resources completely; never merged
    #[error("Upstream poll failed for agent {agent}: {reason}")]
    UpstreamPoll { agent: String, reason: String },

    /// A key could not be decoded for its namespace
    #[error("Malformed cache key '{key}': {reason}")]
    MalformedKey { key: String, reason: String },

    /// Optimistic concurrency conflict in the backing store
    #[error("Merge conflict in namespace {namespace} (scope {scope})")]
    MergeConflict { namespace: String, scope: String },

    /// A second agent claimed an already-owned authoritative scope
    #[error("Namespace {namespace} scope {scope} is already authoritatively owned by {existing}")]
    AuthorityConflict {
        namespace: String,
        scope: String,
        existing: String,
    },

    /// Operation timeout
    #[error("Operation timed out after {timeout_seconds}s: {context}")]
    Timeout {
        timeout_seconds: u64,
        context: String,
    },

    /// Connection error - network or connection pool issues
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Query execution error
    #[error("Query error: {0}")]
    QueryError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Neo4rs driver error (wrapper)
    #[error("Neo4rs driver error: {0}")]
    DriverError(#[from] neo4rs::Error),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

impl CacheError {
    /// Build a `MalformedKey` error
    pub fn malformed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        CacheError::MalformedKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Build an `UpstreamPoll` error
    pub fn upstream(agent: impl Into<String>, reason: impl Into<String>) -> Self {
        CacheError::UpstreamPoll {
            agent: agent.into(),
            reason: reason.into(),
        }
    }

    /// Whether the merge engine should retry from a fresh read
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheError::MergeConflict { .. })
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::SerializationError(e.to_string())
    }
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl From<String> for CacheError {
    fn from(s: String) -> Self {
        CacheError::Other(s)
    }
}

impl From<&str> for CacheError {
    fn from(s: &str) -> Self {
        CacheError::Other(s.to_string())
    }
}
