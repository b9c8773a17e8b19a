//! Reverse adjacency over record relationships
//!
//! Forward edges live on each record (`CacheData::relationships`). This index
//! keeps the inverse, `target key -> source namespace -> source keys`, so a
//! reader can ask "who points at this key?" without scanning the store. The
//! owning store updates it in the same critical section as every upsert and
//! eviction.

use crate::data::Relationships;
use crate::filter::RelationshipFilter;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Sources referencing a key, grouped by their namespace
pub type References = BTreeMap<String, BTreeSet<String>>;

/// Reverse relationship index
#[derive(Debug, Default)]
pub struct RelationshipIndex {
    reverse: HashMap<String, References>,
}

impl RelationshipIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `source` (in `source_namespace`) points at each of `targets`
    pub fn link<'a, I>(&mut self, source_namespace: &str, source: &str, targets: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        for target in targets {
            self.reverse
                .entry(target.clone())
                .or_default()
                .entry(source_namespace.to_string())
                .or_default()
                .insert(source.to_string());
        }
    }

    /// Record every forward edge of a record
    pub fn link_all(&mut self, source_namespace: &str, source: &str, relationships: &Relationships) {
        for targets in relationships.values() {
            self.link(source_namespace, source, targets);
        }
    }

    /// Forget every forward edge of a record that is being removed
    pub fn unlink_all(&mut self, source_namespace: &str, source: &str, relationships: &Relationships) {
        for target in relationships.values().flatten() {
            if let Some(refs) = self.reverse.get_mut(target) {
                if let Some(sources) = refs.get_mut(source_namespace) {
                    sources.remove(source);
                    if sources.is_empty() {
                        refs.remove(source_namespace);
                    }
                }
                if refs.is_empty() {
                    self.reverse.remove(target);
                }
            }
        }
    }

    /// Drop a key as a target, returning the sources that referenced it
    ///
    /// The caller strips the key from each returned source record.
    pub fn detach_target(&mut self, target: &str) -> References {
        self.reverse.remove(target).unwrap_or_default()
    }

    /// Sources referencing `target`, restricted by `filter`
    pub fn references_to(&self, target: &str, filter: &RelationshipFilter) -> References {
        match self.reverse.get(target) {
            Some(refs) => refs
                .iter()
                .filter(|(ns, _)| filter.includes(ns))
                .map(|(ns, keys)| (ns.clone(), keys.clone()))
                .collect(),
            None => References::new(),
        }
    }

    /// Forward relationships of a record unioned with its reverse references
    pub fn hydrate(&self, id: &str, forward: &Relationships, filter: &RelationshipFilter) -> Relationships {
        if filter.is_none() {
            return Relationships::new();
        }

        let mut out: Relationships = forward
            .iter()
            .filter(|(ns, keys)| filter.includes(ns) && !keys.is_empty())
            .map(|(ns, keys)| (ns.clone(), keys.clone()))
            .collect();

        for (ns, sources) in self.references_to(id, filter) {
            out.entry(ns).or_default().extend(sources);
        }
        out
    }

    /// Number of keys that have at least one reference
    pub fn len(&self) -> usize {
        self.reverse.len()
    }

    /// True when nothing references anything
    pub fn is_empty(&self) -> bool {
        self.reverse.is_empty()
    }
}
