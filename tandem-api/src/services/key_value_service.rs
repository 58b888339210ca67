//! Key/Value Service
//!
//! Fans every operation out to the two backends:
//!
//! - `put` writes both stores concurrently under one cancellation scope
//! - `get` consults the local cache, then races both stores
//! - `delete` removes from PostgreSQL first, then from etcd
//!
//! Cache coherence across instances relies entirely on the invalidation bus.
//! A write never evicts the local cache directly; this instance hears its
//! own announcement through the same subscription as everyone else.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tandem_core::{Backend, KeyValue, RepoError};
use tandem_storage::{
    delete_key_value, fetch_all_key_values, fetch_key_value, upsert_key_value, Cache, CacheStats,
    InvalidationBus, Repository,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

// ============================================================================
// ERRORS
// ============================================================================

/// Errors surfaced by [`KeyValueService`].
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Neither store has a live record for the key.
    #[error("key '{key}' not found")]
    NotFound { key: String },

    /// Both reads failed and at least one failure was not a plain miss.
    #[error("both reads failed: etcd: {etcd}; postgres: {postgres}")]
    Read { etcd: RepoError, postgres: RepoError },

    /// The first write failure of a put, or a failing delete step.
    #[error("write failed: {source}")]
    Write {
        #[source]
        source: RepoError,
    },

    /// The operation was abandoned because a sibling write failed.
    #[error("operation cancelled")]
    Cancelled,

    /// The request deadline passed before the operation finished.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ServiceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ServiceError::NotFound { .. })
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

// ============================================================================
// SERVICE
// ============================================================================

/// Orchestrates reads and writes across the etcd and PostgreSQL repositories.
pub struct KeyValueService {
    cache: Arc<dyn Cache>,
    etcd: Arc<dyn Repository<KeyValue>>,
    postgres: Arc<dyn Repository<KeyValue>>,
    bus: Arc<dyn InvalidationBus>,
    cache_ttl: Duration,
    hits: AtomicU64,
}

impl KeyValueService {
    pub fn new(
        cache: Arc<dyn Cache>,
        etcd: Arc<dyn Repository<KeyValue>>,
        postgres: Arc<dyn Repository<KeyValue>>,
        bus: Arc<dyn InvalidationBus>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            cache,
            etcd,
            postgres,
            bus,
            cache_ttl,
            hits: AtomicU64::new(0),
        }
    }

    /// Cache hits since start or since the last invalidation.
    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    /// Write `unit` to both stores.
    ///
    /// Both writes start together. The first one to fail cancels the other,
    /// and its error is the one reported. An invalidation for the key is
    /// published once both writes have settled, whatever the outcome.
    pub async fn put(&self, mut unit: KeyValue) -> ServiceResult<()> {
        let now = Utc::now();
        if unit.audit.created_at == DateTime::<Utc>::default() {
            unit.audit.created_at = now;
        }
        unit.audit.updated_at = Some(now);

        let scope = CancellationToken::new();
        let first_error = OnceLock::new();
        let (etcd, postgres) = tokio::join!(
            guarded_write(self.etcd.as_ref(), &unit, &scope, &first_error),
            guarded_write(self.postgres.as_ref(), &unit, &scope, &first_error),
        );

        self.publish_invalidation(&unit.key).await;

        if let Some(source) = first_error.into_inner() {
            return Err(ServiceError::Write { source });
        }
        // Cancellation is only ever triggered by a recorded failure.
        etcd.and(postgres)
    }

    /// Look a key up in the cache, falling back to a race between the stores.
    ///
    /// The first store to answer without error wins, and its record is
    /// written back to the cache. The key is reported missing only when both
    /// stores report it missing.
    pub async fn get(&self, key: &str) -> ServiceResult<KeyValue> {
        if let Some(bytes) = self.cache.get(key).await {
            match serde_json::from_slice::<KeyValue>(&bytes) {
                Ok(cached) => {
                    let hits = self.hits.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::debug!(key, hits, "Cache hit");
                    return Ok(cached);
                }
                Err(e) => tracing::debug!(key, error = %e, "Discarding undecodable cache entry"),
            }
        }

        let raced = race_backends(
            fetch_key_value(self.etcd.as_ref(), key),
            fetch_key_value(self.postgres.as_ref(), key),
        )
        .await;

        match raced {
            Ok((record, winner)) => {
                tracing::debug!(key, backend = %winner, "Read served by backend");
                match encode(&record) {
                    Ok(bytes) => self.cache.set(key, bytes, self.cache_ttl).await,
                    Err(e) => tracing::warn!(key, error = %e, "Skipping cache fill"),
                }
                Ok(record)
            }
            Err((etcd, postgres)) => {
                if etcd.is_not_found() && postgres.is_not_found() {
                    return Err(ServiceError::NotFound { key: key.to_string() });
                }
                tracing::error!(key, etcd_error = %etcd, postgres_error = %postgres, "Both reads failed");
                Err(ServiceError::Read { etcd, postgres })
            }
        }
    }

    /// Every live record under `prefix`, from whichever store answers first.
    pub async fn list(&self, prefix: &str) -> ServiceResult<Vec<KeyValue>> {
        let raced = race_backends(
            fetch_all_key_values(self.etcd.as_ref(), prefix),
            fetch_all_key_values(self.postgres.as_ref(), prefix),
        )
        .await;

        match raced {
            Ok((records, winner)) => {
                tracing::debug!(prefix, backend = %winner, count = records.len(), "List served by backend");
                Ok(records)
            }
            Err((etcd, postgres)) => {
                tracing::error!(prefix, etcd_error = %etcd, postgres_error = %postgres, "Both listings failed");
                Err(ServiceError::Read { etcd, postgres })
            }
        }
    }

    /// Remove a key: PostgreSQL first, then etcd.
    ///
    /// Deleting an already deleted key re-stamps the PostgreSQL row, so
    /// deleting twice succeeds. A key PostgreSQL has never seen still goes
    /// on to etcd, which clears a record left behind by a half-failed put.
    /// The invalidation is published only after the etcd delete succeeds.
    pub async fn delete(&self, key: &str) -> ServiceResult<()> {
        let mut target = KeyValue::with_key(key);
        target.audit.updated_at = Some(Utc::now());

        match delete_key_value(self.postgres.as_ref(), &target).await {
            Ok(_) => {}
            Err(RepoError::PostgresNoRows) => {
                tracing::debug!(key, "Key was never written to PostgreSQL");
            }
            Err(source) => return Err(ServiceError::Write { source }),
        }

        delete_key_value(self.etcd.as_ref(), &target)
            .await
            .map_err(|source| ServiceError::Write { source })?;

        self.publish_invalidation(key).await;
        Ok(())
    }

    /// Evict `key` from the local cache and reset the hit counter.
    pub async fn apply_invalidation(&self, key: &str) {
        let evicted = self.cache.delete(key).await;
        self.hits.store(0, Ordering::Relaxed);
        tracing::debug!(key, evicted, "Cache invalidated");
    }

    async fn publish_invalidation(&self, key: &str) {
        if let Err(e) = self.bus.publish(key).await {
            tracing::error!(key, error = %e, "Failed to publish cache invalidation");
        }
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn encode(record: &KeyValue) -> ServiceResult<Vec<u8>> {
    Ok(serde_json::to_vec(record)?)
}

/// Run one write, giving up as soon as `scope` is cancelled.
///
/// A failure cancels `scope` and records itself in `first_error` if no
/// other failure got there first.
async fn guarded_write(
    repo: &dyn Repository<KeyValue>,
    unit: &KeyValue,
    scope: &CancellationToken,
    first_error: &OnceLock<RepoError>,
) -> ServiceResult<()> {
    let backend = repo.backend();
    // The write is polled first so it is always issued, even when the
    // sibling has already failed.
    let result = tokio::select! {
        biased;
        result = upsert_key_value(repo, unit) => result,
        _ = scope.cancelled() => {
            tracing::debug!(key = %unit.key, %backend, "Write cancelled by sibling failure");
            return Err(ServiceError::Cancelled);
        }
    };

    match result {
        Ok(_) => Ok(()),
        Err(e) => {
            tracing::warn!(key = %unit.key, %backend, error = %e, "Write failed");
            let _ = first_error.set(e.clone());
            scope.cancel();
            Err(ServiceError::Write { source: e })
        }
    }
}

/// Race two reads. Returns the first success with the backend that produced
/// it, or both errors once both reads have failed.
async fn race_backends<T, E, P>(etcd: E, postgres: P) -> Result<(T, Backend), (RepoError, RepoError)>
where
    E: Future<Output = Result<T, RepoError>>,
    P: Future<Output = Result<T, RepoError>>,
{
    tokio::pin!(etcd);
    tokio::pin!(postgres);

    let mut etcd_error = None;
    let mut postgres_error = None;

    loop {
        tokio::select! {
            result = &mut etcd, if etcd_error.is_none() => match result {
                Ok(value) => return Ok((value, Backend::Etcd)),
                Err(e) => etcd_error = Some(e),
            },
            result = &mut postgres, if postgres_error.is_none() => match result {
                Ok(value) => return Ok((value, Backend::Postgres)),
                Err(e) => postgres_error = Some(e),
            },
        }

        match (etcd_error.take(), postgres_error.take()) {
            (Some(etcd), Some(postgres)) => return Err((etcd, postgres)),
            (etcd, postgres) => {
                etcd_error = etcd;
                postgres_error = postgres;
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
