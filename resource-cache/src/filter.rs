//! Relationship hydration filter for reads

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Selects which related namespaces a read should hydrate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationshipFilter {
    /// Skip relationship hydration entirely
    None,

    /// Hydrate every related namespace
    #[default]
    All,

    /// Hydrate only the named namespaces
    Only(BTreeSet<String>),
}

impl RelationshipFilter {
    /// Filter for a fixed list of namespaces
    pub fn include<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RelationshipFilter::Only(namespaces.into_iter().map(Into::into).collect())
    }

    /// Whether a related namespace should be hydrated
    pub fn includes(&self, namespace: &str) -> bool {
        match self {
            RelationshipFilter::None => false,
            RelationshipFilter::All => true,
            RelationshipFilter::Only(set) => set.contains(namespace),
        }
    }

    /// True when no hydration is requested
    pub fn is_none(&self) -> bool {
        match self {
            RelationshipFilter::None => true,
            RelationshipFilter::Only(set) => set.is_empty(),
            RelationshipFilter::All => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_includes() {
        assert!(!RelationshipFilter::None.includes("clusters"));
        assert!(RelationshipFilter::All.includes("clusters"));

        let only = RelationshipFilter::include(["clusters", "instances"]);
        assert!(only.includes("clusters"));
        assert!(!only.includes("loadBalancers"));
    }

    #[test]
    fn test_empty_only_is_none() {
        assert!(RelationshipFilter::include(Vec::<String>::new()).is_none());
        assert!(RelationshipFilter::None.is_none());
        assert!(!RelationshipFilter::default().is_none());
    }
}
