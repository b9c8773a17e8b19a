//! Counters for cache activity

use serde::{Deserialize, Serialize};
use std::fmt;

/// Statistics and metrics for cache monitoring
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CacheStats {
    /// Reads that found the requested record
    pub hits: u64,

    /// Reads for keys that were not present
    pub misses: u64,

    /// Number of records currently stored
    pub entries: usize,

    /// Approximate size of stored records in bytes
    pub size_bytes: usize,

    /// Records inserted or changed by merges
    pub items_merged: u64,

    /// Writes skipped because the content hash was unchanged
    pub writes_skipped: u64,

    /// Records removed by eviction (authoritative, explicit or cleanup)
    pub evictions: u64,

    /// Records removed because their TTL elapsed
    pub expirations: u64,
}

impl CacheStats {
    /// Calculate cache hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }

    /// Calculate miss rate as a percentage
    pub fn miss_rate(&self) -> f64 {
        100.0 - self.hit_rate()
    }

    /// Evictions plus expirations
    pub fn total_removals(&self) -> u64 {
        self.evictions + self.expirations
    }

    /// Share of submitted writes that were skipped as unchanged
    pub fn skip_rate(&self) -> f64 {
        let total = self.items_merged + self.writes_skipped;
        if total == 0 {
            0.0
        } else {
            (self.writes_skipped as f64 / total as f64) * 100.0
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ hits: {}, misses: {}, hit_rate: {:.2}%, entries: {}, merged: {}, skipped: {}, evictions: {}, expirations: {} }}",
            self.hits,
            self.misses,
            self.hit_rate(),
            self.entries,
            self.items_merged,
            self.writes_skipped,
            self.evictions,
            self.expirations
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };

        assert_eq!(stats.hit_rate(), 80.0);
        assert_eq!(stats.miss_rate(), 20.0);
    }

    #[test]
    fn test_cache_stats_zero_requests() {
        let stats = CacheStats::default();
        assert_eq!(stats.hit_rate(), 0.0);
        assert_eq!(stats.miss_rate(), 100.0);
        assert_eq!(stats.skip_rate(), 0.0);
    }

    #[test]
    fn test_skip_rate() {
        let stats = CacheStats {
            items_merged: 25,
            writes_skipped: 75,
            ..Default::default()
        };
        assert_eq!(stats.skip_rate(), 75.0);
    }

    #[test]
    fn test_cache_stats_display() {
        let stats = CacheStats {
            hits: 100,
            misses: 50,
            entries: 75,
            evictions: 10,
            expirations: 5,
            ..Default::default()
        };

        let display = format!("{}", stats);
        assert!(display.contains("hits: 100"));
        assert!(display.contains("misses: 50"));
        assert!(display.contains("expirations: 5"));
        assert_eq!(stats.total_removals(), 15);
    }
}
