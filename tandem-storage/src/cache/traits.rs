//! Cache trait and statistics.
//!
//! The orchestrator talks to its local cache only through [`Cache`], so the
//! in-memory implementation can be swapped for another backend.

use std::time::Duration;

use async_trait::async_trait;

/// Local key/value cache with per-entry expiry.
///
/// Values are opaque bytes; callers choose the encoding. Implementations
/// must be safe for concurrent use.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Get an unexpired value.
    async fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Store `value` under `key` for `ttl`, replacing any previous entry.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration);

    /// Remove `key`. Returns whether an entry was present.
    async fn delete(&self, key: &str) -> bool;

    /// Get cache statistics.
    async fn stats(&self) -> CacheStats;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries currently in cache (expired ones included until collected).
    pub entry_count: u64,
    /// Approximate payload size in bytes.
    pub memory_bytes: u64,
    /// Number of entries dropped because they expired.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
