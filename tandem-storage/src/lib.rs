//! Tandem Storage - Repositories and Backend Plumbing
//!
//! The [`Repository`] trait and its two implementations (etcd and
//! PostgreSQL), the bounded etcd client pool, the local cache, and the
//! invalidation bus that keeps caches coherent across instances.

use async_trait::async_trait;
use tandem_core::{Action, Backend, Entity, KeyValue, RepoError, ScanError, Scanner};

pub mod cache;
pub mod etcd_repo;
pub mod invalidation;
pub mod kv;
pub mod memory_kv;
pub mod pool;
pub mod postgres_repo;

pub use cache::{Cache, CacheConfig, CacheStats, MemoryCache};
pub use etcd_repo::{EtcdRepository, KEYSPACE_START};
pub use invalidation::{EtcdInvalidationBus, InvalidationBus, InvalidationStream, CACHE_INVALIDATE_KEY};
pub use kv::{
    ConnectionFactory, EtcdConfig, EtcdConnection, EtcdConnectionFactory, KvConnection, KvEntry, KvError,
    WatchEvent, WatchStream,
};
pub use memory_kv::{InMemoryConnection, InMemoryKvFactory, InMemoryKvStore};
pub use pool::{ClientPool, PoolStats, PooledConnection};
pub use postgres_repo::{DbConfig, PostgresRepository, RetryConfig, RowScanner};

/// Maps a scanner onto an entity.
pub type ScanFn<'a, E> = &'a (dyn Fn(&dyn Scanner) -> Result<E, ScanError> + Send + Sync);

// ============================================================================
// REPOSITORY TRAIT
// ============================================================================

/// A backend that can run entity actions.
///
/// Implementations are stateless with respect to requests and safe to share
/// across tasks.
#[async_trait]
pub trait Repository<E: Entity>: Send + Sync {
    /// Which store this repository talks to.
    fn backend(&self) -> Backend;

    /// Run a single-result action and map the result through `scan`.
    async fn execute(&self, action: &Action<E>, entity: &E, scan: ScanFn<'_, E>) -> Result<E, RepoError>;

    /// Run a multi-result action, mapping each record through `scan`.
    async fn execute_many(&self, action: &Action<E>, entity: &E, scan: ScanFn<'_, E>)
        -> Result<Vec<E>, RepoError>;
}

// ============================================================================
// KEY VALUE HELPERS
// ============================================================================

/// Point lookup of one live record.
pub async fn fetch_key_value(repo: &dyn Repository<KeyValue>, key: &str) -> Result<KeyValue, RepoError> {
    repo.execute(&KeyValue::SELECT, &KeyValue::with_key(key), &KeyValue::scan)
        .await
}

/// Every live record whose key starts with `prefix` (all records for `""`).
pub async fn fetch_all_key_values(
    repo: &dyn Repository<KeyValue>,
    prefix: &str,
) -> Result<Vec<KeyValue>, RepoError> {
    repo.execute_many(&KeyValue::GETALL, &KeyValue::with_key(prefix), &KeyValue::scan)
        .await
}

/// Insert or replace a record.
pub async fn upsert_key_value(repo: &dyn Repository<KeyValue>, kv: &KeyValue) -> Result<KeyValue, RepoError> {
    repo.execute(&KeyValue::UPSERT, kv, &KeyValue::scan).await
}

/// Delete a record (soft delete on the relational store).
pub async fn delete_key_value(repo: &dyn Repository<KeyValue>, kv: &KeyValue) -> Result<KeyValue, RepoError> {
    repo.execute(&KeyValue::DELETE, kv, &KeyValue::scan).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn etcd_repo() -> EtcdRepository<InMemoryKvFactory> {
        let factory = InMemoryKvFactory::new(InMemoryKvStore::new());
        EtcdRepository::new(ClientPool::new(factory, 4, Duration::from_millis(50)))
    }

    #[tokio::test]
    async fn test_helpers_through_trait_object() {
        let repo = etcd_repo();
        let repo: &dyn Repository<KeyValue> = &repo;
        assert_eq!(repo.backend(), Backend::Etcd);

        upsert_key_value(repo, &KeyValue::new("app/a", "1")).await.unwrap();
        upsert_key_value(repo, &KeyValue::new("app/b", "2")).await.unwrap();
        upsert_key_value(repo, &KeyValue::new("other", "3")).await.unwrap();

        assert_eq!(fetch_key_value(repo, "app/b").await.unwrap().value, "2");
        assert_eq!(fetch_all_key_values(repo, "app/").await.unwrap().len(), 2);
        assert_eq!(fetch_all_key_values(repo, "").await.unwrap().len(), 3);

        delete_key_value(repo, &KeyValue::with_key("app/a")).await.unwrap();
        assert!(fetch_key_value(repo, "app/a").await.unwrap_err().is_not_found());
    }
}
