//! In-memory TTL cache
//!
//! Entries expire lazily on read; a background sweep started with
//! [`MemoryCache::spawn_gc`] drops expired entries nobody reads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tandem_core::ConfigError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::traits::{Cache, CacheStats};
use crate::kv::env_millis;

/// Configuration for the local cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// When false the cache stores nothing and every lookup misses.
    pub enabled: bool,
    /// TTL for cached entries.
    pub ttl: Duration,
    /// How often the background sweep runs.
    pub gc_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(60),
            gc_interval: Duration::from_secs(10),
        }
    }
}

impl CacheConfig {
    /// Load from `TANDEM_CACHE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let enabled = match std::env::var("TANDEM_CACHE_ENABLED") {
            Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(ConfigError::invalid("TANDEM_CACHE_ENABLED", raw)),
            },
            Err(_) => defaults.enabled,
        };
        let config = Self {
            enabled,
            ttl: env_millis("TANDEM_CACHE_TTL_MS")?.unwrap_or(defaults.ttl),
            gc_interval: env_millis("TANDEM_CACHE_GC_INTERVAL_MS")?.unwrap_or(defaults.gc_interval),
        };
        if config.gc_interval.is_zero() {
            return Err(ConfigError::invalid("TANDEM_CACHE_GC_INTERVAL_MS", "must be > 0"));
        }
        Ok(config)
    }

    /// Set the entry TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// Dashmap-backed cache with per-entry expiry.
#[derive(Debug)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
    enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

impl MemoryCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            enabled: config.enabled,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let removed = before.saturating_sub(self.entries.len());
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Run [`purge_expired`](Self::purge_expired) every `interval` until `shutdown` fires.
    pub fn spawn_gc(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("Cache GC stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = self.purge_expired();
                        if removed > 0 {
                            tracing::debug!(removed, remaining = self.len(), "Cache GC sweep");
                        }
                    }
                }
            }
        })
    }

    fn lookup(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired && self.entries.remove_if(key, |_, e| e.expires_at <= now).is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        None
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let found = if self.enabled { self.lookup(key) } else { None };
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        if !self.enabled || ttl.is_zero() {
            return;
        }
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    async fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    async fn stats(&self) -> CacheStats {
        let memory_bytes = self
            .entries
            .iter()
            .map(|e| (e.key().len() + e.value().value.len()) as u64)
            .sum();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.entries.len() as u64,
            memory_bytes,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = MemoryCache::default();
        cache.set("k", b"v".to_vec(), Duration::from_secs(5)).await;
        assert_eq!(cache.get("k").await, Some(b"v".to_vec()));
        assert!(cache.delete("k").await);
        assert!(!cache.delete("k").await);
        assert_eq!(cache.get("k").await, None);

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_lazily() {
        let cache = MemoryCache::default();
        cache.set("k", b"v".to_vec(), Duration::from_millis(100)).await;
        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(cache.get("k").await, None);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().await.evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_sweeps_unread_entries() {
        let cache = Arc::new(MemoryCache::default());
        cache.set("a", b"1".to_vec(), Duration::from_millis(50)).await;
        cache.set("b", b"2".to_vec(), Duration::from_secs(60)).await;

        let token = CancellationToken::new();
        let gc = Arc::clone(&cache).spawn_gc(Duration::from_millis(100), token.clone());
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(cache.len(), 1);

        token.cancel();
        gc.await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_cache_stores_nothing() {
        let cache = MemoryCache::new(&CacheConfig::disabled());
        cache.set("k", b"v".to_vec(), Duration::from_secs(5)).await;
        assert_eq!(cache.get("k").await, None);
        assert!(cache.is_empty());
    }
}
