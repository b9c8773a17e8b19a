//! Why records leave the cache
//!
//! Every removal path (authoritative merge, explicit eviction, TTL expiry,
//! orphan sweep, reconciliation) reports an [`InvalidationEvent`] so callers
//! and logs can tell them apart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reason for cache invalidation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvalidationReason {
    /// Entry expired based on TTL
    Expired,

    /// Absent from a fresh authoritative snapshot of its scope
    Authoritative { agent: String },

    /// Listed in a result's explicit evictions or evicted by key
    Explicit,

    /// Removed by an orphan sweep
    Orphaned { sweep: String },

    /// Record deleted from an external system of record
    Reconciled,
}

impl std::fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidationReason::Expired => write!(f, "TTL expired"),
            InvalidationReason::Authoritative { agent } => {
                write!(f, "missing from authoritative snapshot of {}", agent)
            }
            InvalidationReason::Explicit => write!(f, "explicit eviction"),
            InvalidationReason::Orphaned { sweep } => write!(f, "orphaned ({})", sweep),
            InvalidationReason::Reconciled => write!(f, "reconciled against system of record"),
        }
    }
}

/// Event for cache invalidation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationEvent {
    /// Reason for invalidation
    pub reason: InvalidationReason,

    /// Namespace the keys belong to
    pub namespace: String,

    /// When the invalidation occurred
    pub timestamp: DateTime<Utc>,

    /// Keys that were invalidated
    pub keys: Vec<String>,

    /// Additional context
    pub context: Option<String>,
}

impl InvalidationEvent {
    /// Create a new invalidation event
    pub fn new(reason: InvalidationReason, namespace: impl Into<String>, keys: Vec<String>) -> Self {
        Self {
            reason,
            namespace: namespace.into(),
            timestamp: Utc::now(),
            keys,
            context: None,
        }
    }

    /// Add context to the event
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Number of keys invalidated
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True when no keys were invalidated
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalidation_reason_display() {
        let reason = InvalidationReason::Expired;
        assert_eq!(reason.to_string(), "TTL expired");

        let reason = InvalidationReason::Authoritative {
            agent: "aws/prod/us-east-1/ServerGroupCachingAgent".to_string(),
        };
        assert!(reason.to_string().contains("ServerGroupCachingAgent"));

        let reason = InvalidationReason::Orphaned {
            sweep: "clusters-without-server-groups".to_string(),
        };
        assert!(reason.to_string().contains("clusters-without-server-groups"));
    }

    #[test]
    fn test_invalidation_event() {
        let event = InvalidationEvent::new(
            InvalidationReason::Explicit,
            "instances",
            vec!["aws:instances:prod:us-east-1:i-1".to_string()],
        )
        .with_context("terminated upstream");

        assert_eq!(event.namespace, "instances");
        assert_eq!(event.len(), 1);
        assert!(!event.is_empty());
        assert_eq!(event.context.as_deref(), Some("terminated upstream"));
    }
}
