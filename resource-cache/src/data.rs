//! The unit of storage: a keyed record with attributes and relationships

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// Attribute map: field name -> arbitrary JSON value
pub type Attributes = BTreeMap<String, Value>;

/// Relationship map: related namespace -> related keys
pub type Relationships = BTreeMap<String, BTreeSet<String>>;

/// A cached entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheData {
    /// The cache key
    pub id: String,

    /// Provider-specific attributes (schema documented per namespace)
    #[serde(default)]
    pub attributes: Attributes,

    /// Links to entities in other namespaces
    #[serde(default)]
    pub relationships: Relationships,

    /// Optional per-record time-to-live in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
}

impl CacheData {
    /// Create an empty record for `id`
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: Attributes::new(),
            relationships: Relationships::new(),
            ttl_seconds: None,
        }
    }

    /// Set an attribute
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Add a relationship to a key in another namespace
    pub fn with_relationship(mut self, namespace: impl Into<String>, key: impl Into<String>) -> Self {
        self.add_relationship(namespace, key);
        self
    }

    /// Set the time-to-live
    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }

    /// Add a relationship in place
    pub fn add_relationship(&mut self, namespace: impl Into<String>, key: impl Into<String>) {
        self.relationships
            .entry(namespace.into())
            .or_default()
            .insert(key.into());
    }

    /// Get an attribute value
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Related keys in one namespace (empty when none)
    pub fn related(&self, namespace: &str) -> impl Iterator<Item = &str> {
        self.relationships
            .get(namespace)
            .into_iter()
            .flat_map(|keys| keys.iter().map(String::as_str))
    }

    /// Merge another write of the same entity into this one
    ///
    /// Attributes are last-write-wins per field, relationships are unioned
    /// and a newer TTL replaces the old one. Returns true if anything
    /// observable changed.
    pub fn merge_from(&mut self, other: &CacheData) -> bool {
        let mut changed = false;

        for (name, value) in &other.attributes {
            if self.attributes.get(name) != Some(value) {
                self.attributes.insert(name.clone(), value.clone());
                changed = true;
            }
        }

        for (namespace, keys) in &other.relationships {
            let existing = self.relationships.entry(namespace.clone()).or_default();
            for key in keys {
                changed |= existing.insert(key.clone());
            }
        }

        if other.ttl_seconds.is_some() && other.ttl_seconds != self.ttl_seconds {
            self.ttl_seconds = other.ttl_seconds;
            changed = true;
        }

        changed
    }

    /// Remove a key from every relationship set; returns true if it was present
    pub fn remove_related_key(&mut self, key: &str) -> bool {
        let mut removed = false;
        for keys in self.relationships.values_mut() {
            removed |= keys.remove(key);
        }
        self.relationships.retain(|_, keys| !keys.is_empty());
        removed
    }

    /// SHA-256 over the canonical JSON of attributes and relationships
    pub fn content_hash(&self) -> Result<String> {
        // BTreeMap ordering makes the serialization canonical
        let body = serde_json::to_vec(&(&self.attributes, &self.relationships))?;
        Ok(hex::encode(Sha256::digest(&body)))
    }

    /// Approximate in-memory size of this record
    pub fn calculate_size(&self) -> usize {
        let attrs: usize = self
            .attributes
            .iter()
            .map(|(k, v)| k.len() + v.to_string().len())
            .sum();
        let rels: usize = self
            .relationships
            .iter()
            .map(|(ns, keys)| ns.len() + keys.iter().map(String::len).sum::<usize>())
            .sum();
        self.id.len() + attrs + rels
    }
}
