//! Cross-instance cache invalidation
//!
//! Writers announce a changed key by putting it as the value of a reserved
//! key in the distributed store. Every instance watches that reserved key
//! and evicts the announced key from its local cache.

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use tandem_core::RepoError;

use crate::kv::{ConnectionFactory, KvConnection, KvError, WatchEvent};
use crate::pool::ClientPool;

/// Reserved key carrying invalidation announcements.
pub const CACHE_INVALIDATE_KEY: &str = "Y2FjaGUtaW52YWxpZGF0ZQo=";

/// Stream of invalidated keys.
pub type InvalidationStream = BoxStream<'static, Result<String, KvError>>;

/// Publishes and receives cache invalidation announcements.
#[async_trait]
pub trait InvalidationBus: Send + Sync {
    /// Announce that `key` changed.
    async fn publish(&self, key: &str) -> Result<(), RepoError>;

    /// Receive announced keys, from now on.
    async fn subscribe(&self) -> Result<InvalidationStream, RepoError>;
}

/// Invalidation bus over the distributed store.
///
/// Publishing borrows a pooled client; subscribing opens a dedicated client
/// so a long-lived watch never holds a pool slot.
pub struct EtcdInvalidationBus<F: ConnectionFactory> {
    pool: ClientPool<F>,
}

impl<F: ConnectionFactory> EtcdInvalidationBus<F> {
    pub fn new(pool: ClientPool<F>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl<F: ConnectionFactory> InvalidationBus for EtcdInvalidationBus<F> {
    async fn publish(&self, key: &str) -> Result<(), RepoError> {
        let conn = self.pool.acquire().await?;
        conn.put(CACHE_INVALIDATE_KEY, key).await?;
        tracing::debug!(key, "Published cache invalidation");
        Ok(())
    }

    async fn subscribe(&self) -> Result<InvalidationStream, RepoError> {
        let conn = self.pool.factory().connect().await?;
        let events = conn.watch(CACHE_INVALIDATE_KEY).await?;
        // The dedicated connection lives exactly as long as the stream.
        let keys = events
            .filter_map(|event| {
                futures_util::future::ready(match event {
                    Ok(WatchEvent::Put(entry)) => Some(Ok(entry.value)),
                    Ok(WatchEvent::Delete { .. }) => None,
                    Err(err) => Some(Err(err)),
                })
            })
            .map(move |item| {
                let _held = &conn;
                item
            });
        Ok(keys.boxed())
    }
}
