//! Stored record with TTL and write metadata

use crate::data::CacheData;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A record as held by a store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEntry {
    /// The record, relationships as written (not hydrated)
    pub data: CacheData,

    /// Entry metadata
    pub metadata: EntryMetadata,
}

/// Metadata associated with a stored record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// When the entry was first written
    pub created_at: DateTime<Utc>,

    /// Last time a write changed the entry
    pub updated_at: DateTime<Utc>,

    /// When the entry expires; None never expires
    pub expires_at: Option<DateTime<Utc>>,

    /// Version number (incremented on changes)
    pub version: u64,

    /// Content hash of the last write, used to skip unchanged writes
    pub write_hash: Option<String>,

    /// Size of the entry in bytes
    pub size_bytes: usize,
}

impl StoredEntry {
    /// Create an entry for a first write
    pub fn new(data: CacheData, ttl: Option<Duration>, write_hash: Option<String>) -> Self {
        let now = Utc::now();
        let size_bytes = data.calculate_size();

        Self {
            data,
            metadata: EntryMetadata {
                created_at: now,
                updated_at: now,
                expires_at: expiry_from(now, ttl),
                version: 1,
                write_hash,
                size_bytes,
            },
        }
    }

    /// Check if the entry has expired
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Check expiry against a given instant
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.metadata.expires_at, Some(at) if now > at)
    }

    /// Get time until expiration
    pub fn time_until_expiration(&self) -> Option<Duration> {
        let expires_at = self.metadata.expires_at?;
        (expires_at - Utc::now()).to_std().ok()
    }

    /// Get the age of the entry
    pub fn age(&self) -> Duration {
        (Utc::now() - self.metadata.created_at)
            .to_std()
            .unwrap_or(Duration::from_secs(0))
    }

    /// Merge a new write into the entry
    ///
    /// Returns true if the stored content changed. The TTL is refreshed
    /// either way since the writer has just seen the resource.
    pub fn apply(&mut self, incoming: &CacheData, ttl: Option<Duration>, write_hash: Option<String>) -> bool {
        let changed = self.data.merge_from(incoming);
        self.refresh_ttl(ttl);
        self.metadata.write_hash = write_hash;

        if changed {
            self.metadata.updated_at = Utc::now();
            self.metadata.version += 1;
            self.metadata.size_bytes = self.data.calculate_size();
        }
        changed
    }

    /// Push the expiry forward without touching content
    pub fn refresh_ttl(&mut self, ttl: Option<Duration>) {
        if ttl.is_some() {
            self.metadata.expires_at = expiry_from(Utc::now(), ttl);
        }
    }

    /// Remove a related key after its target was evicted
    ///
    /// Clears the write hash so the next identical write is applied again
    /// and restores the relationship.
    pub fn strip_related(&mut self, key: &str) -> bool {
        let removed = self.data.remove_related_key(key);
        if removed {
            self.metadata.write_hash = None;
            self.metadata.version += 1;
            self.metadata.size_bytes = self.data.calculate_size();
        }
        removed
    }
}

fn expiry_from(now: DateTime<Utc>, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    let ttl = ttl?;
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
    Some(now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC))
}
