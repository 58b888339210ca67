//! Bounded client pool
//!
//! Hands out distributed-store client handles, creating them lazily up to a
//! fixed capacity. Checkout is bounded by a semaphore so a saturated pool
//! makes callers wait (up to `acquire_timeout`) instead of spinning.
//! Returning a handle happens in [`PooledConnection`]'s `Drop`.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tandem_core::{ConnectivityState, PoolError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::kv::{ConnectionFactory, EtcdConfig, KvConnection};

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Maximum number of live handles
    pub capacity: usize,
    /// Handles created and not yet closed
    pub live: usize,
    /// Handles parked in the idle buffer
    pub idle: usize,
    /// Checkouts that could start right now
    pub available: usize,
    pub closed: bool,
}

struct PoolInner<F: ConnectionFactory> {
    factory: F,
    idle: Mutex<VecDeque<F::Connection>>,
    live: AtomicUsize,
    permits: Arc<Semaphore>,
    capacity: usize,
    acquire_timeout: Duration,
    closed: AtomicBool,
}

impl<F: ConnectionFactory> PoolInner<F> {
    fn idle(&self) -> MutexGuard<'_, VecDeque<F::Connection>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn retire(&self, conn: F::Connection) {
        conn.close();
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    fn release(&self, conn: F::Connection) {
        if self.closed.load(Ordering::SeqCst) || conn.state() == ConnectivityState::Shutdown {
            self.retire(conn);
            return;
        }
        let overflow = {
            let mut idle = self.idle();
            if idle.len() >= self.capacity {
                Some(conn)
            } else {
                idle.push_back(conn);
                None
            }
        };
        if let Some(conn) = overflow {
            tracing::debug!(capacity = self.capacity, "Idle buffer full, closing client");
            self.retire(conn);
        }
    }
}

/// A bounded pool of distributed-store client handles.
pub struct ClientPool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for ClientPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> ClientPool<F> {
    pub fn new(factory: F, capacity: usize, acquire_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(PoolInner {
                factory,
                idle: Mutex::new(VecDeque::with_capacity(capacity)),
                live: AtomicUsize::new(0),
                permits: Arc::new(Semaphore::new(capacity)),
                capacity,
                acquire_timeout,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Pool sized from `config`: `pool_multiplier` × available parallelism.
    pub fn from_config(factory: F, config: &EtcdConfig) -> Self {
        Self::new(factory, config.pool_capacity(), config.acquire_timeout)
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Check out a usable handle.
    ///
    /// Idle, connecting and ready handles are returned as-is. A handle in
    /// `Shutdown` fails the call with [`PoolError::BadState`]; handles in
    /// `TransientFailure` are discarded and replaced.
    pub async fn acquire(&self) -> Result<PooledConnection<F>, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        let waited = self.inner.acquire_timeout;
        let permit = match tokio::time::timeout(waited, Arc::clone(&self.inner.permits).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => return Err(PoolError::Timeout { waited }),
        };
        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        for _ in 0..=self.inner.capacity {
            let conn = match self.pop_idle() {
                Some(conn) => conn,
                None => self.create().await?,
            };
            match conn.state() {
                state if state.is_usable() => {
                    return Ok(PooledConnection {
                        conn: Some(conn),
                        pool: Arc::clone(&self.inner),
                        _permit: permit,
                    });
                }
                ConnectivityState::TransientFailure => {
                    tracing::warn!("Discarding etcd client in TRANSIENT_FAILURE");
                    self.inner.retire(conn);
                }
                state => {
                    self.inner.retire(conn);
                    return Err(PoolError::BadState { state });
                }
            }
        }
        Err(PoolError::Exhausted {
            capacity: self.inner.capacity,
        })
    }

    fn pop_idle(&self) -> Option<F::Connection> {
        self.inner.idle().pop_front()
    }

    async fn create(&self) -> Result<F::Connection, PoolError> {
        match self.inner.factory.connect().await {
            Ok(conn) => {
                let live = self.inner.live.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::debug!(live, capacity = self.inner.capacity, "Created etcd client");
                Ok(conn)
            }
            Err(err) => {
                tracing::error!(error = %err, "Create the etcd client failed");
                Err(PoolError::Create {
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Stop handing out handles and close every idle one. Idempotent.
    ///
    /// Handles checked out at the time are closed when their guards drop.
    pub fn graceful_close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.permits.close();
        let drained: Vec<_> = self.inner.idle().drain(..).collect();
        let count = drained.len();
        for conn in drained {
            self.inner.retire(conn);
        }
        tracing::info!(closed_idle = count, "Client pool closed");
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.inner.capacity,
            live: self.inner.live.load(Ordering::SeqCst),
            idle: self.inner.idle().len(),
            available: self.inner.permits.available_permits(),
            closed: self.is_closed(),
        }
    }
}

/// A checked-out client handle. Dropping it returns the handle to the pool.
pub struct PooledConnection<F: ConnectionFactory> {
    conn: Option<F::Connection>,
    pool: Arc<PoolInner<F>>,
    _permit: OwnedSemaphorePermit,
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        match &self.conn {
            Some(conn) => conn,
            // Only taken in Drop.
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_kv::{InMemoryKvFactory, InMemoryKvStore};

    fn pool(capacity: usize) -> (ClientPool<InMemoryKvFactory>, InMemoryKvFactory) {
        let factory = InMemoryKvFactory::new(InMemoryKvStore::new());
        (
            ClientPool::new(factory.clone(), capacity, Duration::from_millis(50)),
            factory,
        )
    }

    #[tokio::test]
    async fn test_handles_are_reused() {
        let (pool, factory) = pool(4);
        {
            let conn = pool.acquire().await.unwrap();
            conn.put("k", "v").await.unwrap();
        }
        assert_eq!(pool.stats().idle, 1);
        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.state(), ConnectivityState::Ready);
        assert_eq!(factory.connect_count(), 1);
        assert_eq!(pool.stats().live, 1);
    }

    #[tokio::test]
    async fn test_shutdown_handle_is_rejected() {
        let (pool, factory) = pool(2);
        factory.set_initial_state(ConnectivityState::Shutdown);
        let err = pool.acquire().await.err().unwrap();
        assert_eq!(
            err,
            PoolError::BadState {
                state: ConnectivityState::Shutdown
            }
        );
        assert!(err.to_string().contains("SHUTDOWN"));
        assert_eq!(pool.stats().live, 0);
    }

    #[tokio::test]
    async fn test_transient_failure_handle_is_replaced() {
        let (pool, factory) = pool(2);
        {
            let conn = pool.acquire().await.unwrap();
            conn.set_state(ConnectivityState::TransientFailure);
        }
        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.state(), ConnectivityState::Idle);
        assert_eq!(factory.connect_count(), 2);
        assert_eq!(pool.stats().live, 1);
    }

    #[tokio::test]
    async fn test_saturated_pool_times_out() {
        let (pool, _factory) = pool(1);
        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, PoolError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_waiter_gets_released_handle() {
        let factory = InMemoryKvFactory::new(InMemoryKvStore::new());
        let pool = ClientPool::new(factory.clone(), 1, Duration::from_secs(5));
        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|c| c.state()) })
        };
        tokio::task::yield_now().await;
        drop(held);
        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(factory.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_create_failure_releases_permit() {
        let (pool, factory) = pool(1);
        factory.set_fail_connect(true);
        assert!(matches!(pool.acquire().await, Err(PoolError::Create { .. })));
        factory.set_fail_connect(false);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_graceful_close_is_idempotent() {
        let (pool, _factory) = pool(3);
        let held = pool.acquire().await.unwrap();
        drop(pool.acquire().await.unwrap());
        assert_eq!(pool.stats().live, 2);

        pool.graceful_close();
        pool.graceful_close();
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().live, 1);
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));

        drop(held);
        assert_eq!(pool.stats().live, 0);
    }

    #[tokio::test]
    async fn test_live_handles_never_exceed_capacity() {
        let (pool, _factory) = pool(3);
        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(pool.acquire().await.unwrap());
        }
        assert!(pool.acquire().await.is_err());
        assert_eq!(pool.stats().live, 3);
        assert_eq!(pool.stats().available, 0);
        held.clear();
        assert_eq!(pool.stats().idle, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_release_stays_within_capacity() {
        let capacity = 4;
        let factory = InMemoryKvFactory::new(InMemoryKvStore::new());
        let pool = ClientPool::new(factory.clone(), capacity, Duration::from_secs(5));

        let workers: Vec<_> = (0..16)
            .map(|worker| {
                let pool = pool.clone();
                tokio::spawn(async move {
                    for round in 0..50 {
                        let conn = pool.acquire().await.unwrap();
                        assert!(pool.stats().live <= capacity);
                        conn.put(&format!("w{worker}"), &round.to_string()).await.unwrap();
                        tokio::task::yield_now().await;
                        drop(conn);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.await.unwrap();
        }

        assert!(factory.connect_count() <= capacity);
        assert!(pool.stats().live <= capacity);
        assert_eq!(pool.stats().available, capacity);
    }
}
