//! In-process distributed-store stand-in
//!
//! Revisioned, lexicographically ordered key/value map with watch support.
//! Used for local development and tests; supports fault injection (failing
//! writes, failing connects, forced connectivity states).

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures_util::StreamExt;
use tandem_core::ConnectivityState;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::kv::{ConnectionFactory, KvConnection, KvEntry, KvError, KvResult, WatchEvent, WatchStream};

const WATCH_BUFFER: usize = 1024;

#[derive(Debug, Default)]
struct StoreState {
    data: BTreeMap<String, KvEntry>,
    revision: i64,
}

#[derive(Debug)]
struct StoreInner {
    state: Mutex<StoreState>,
    events: broadcast::Sender<WatchEvent>,
    fail_writes: AtomicBool,
}

/// Shared in-memory store. Cloning yields another handle to the same data.
#[derive(Debug, Clone)]
pub struct InMemoryKvStore {
    inner: Arc<StoreInner>,
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(StoreState::default()),
                events,
                fail_writes: AtomicBool::new(false),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every subsequent put and delete fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn revision(&self) -> i64 {
        self.lock().revision
    }

    pub fn get(&self, key: &str) -> Option<KvEntry> {
        self.lock().data.get(key).cloned()
    }

    fn check_writable(&self) -> KvResult<()> {
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(KvError::Rejected("writes disabled".to_string()));
        }
        Ok(())
    }

    pub fn put(&self, key: &str, value: &str) -> KvResult<()> {
        self.check_writable()?;
        let entry = {
            let mut state = self.lock();
            state.revision += 1;
            let revision = state.revision;
            let version = state.data.get(key).map_or(0, |e| e.version) + 1;
            let entry = KvEntry {
                key: key.to_string(),
                value: value.to_string(),
                version,
                mod_revision: revision,
            };
            state.data.insert(key.to_string(), entry.clone());
            entry
        };
        // No receivers is fine.
        let _ = self.inner.events.send(WatchEvent::Put(entry));
        Ok(())
    }

    pub fn delete(&self, key: &str) -> KvResult<i64> {
        self.check_writable()?;
        let removed = {
            let mut state = self.lock();
            let removed = state.data.remove(key).is_some();
            if removed {
                state.revision += 1;
            }
            removed
        };
        if removed {
            let _ = self.inner.events.send(WatchEvent::Delete {
                key: key.to_string(),
            });
        }
        Ok(i64::from(removed))
    }

    pub fn get_prefix(&self, prefix: &str) -> Vec<KvEntry> {
        self.lock()
            .data
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn get_from(&self, start: &str) -> Vec<KvEntry> {
        self.lock()
            .data
            .range::<str, _>((Bound::Included(start), Bound::Unbounded))
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Events for `key` only, from now on.
    pub fn watch(&self, key: &str) -> WatchStream {
        let key = key.to_string();
        BroadcastStream::new(self.inner.events.subscribe())
            .filter_map(move |item| {
                let event = match item {
                    Ok(WatchEvent::Put(entry)) if entry.key == key => Some(Ok(WatchEvent::Put(entry))),
                    Ok(WatchEvent::Delete { key: k }) if k == key => Some(Ok(WatchEvent::Delete { key: k })),
                    Ok(_) => None,
                    Err(lagged) => {
                        tracing::warn!(error = %lagged, "In-memory watch lagged");
                        None
                    }
                };
                futures_util::future::ready(event)
            })
            .boxed()
    }
}

// ============================================================================
// CONNECTION
// ============================================================================

/// A client handle onto an [`InMemoryKvStore`].
#[derive(Debug)]
pub struct InMemoryConnection {
    store: InMemoryKvStore,
    state: AtomicU8,
}

impl InMemoryConnection {
    pub fn new(store: InMemoryKvStore, state: ConnectivityState) -> Self {
        Self {
            store,
            state: AtomicU8::new(state as u8),
        }
    }

    /// Force the handle into `state`.
    pub fn set_state(&self, state: ConnectivityState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn check(&self) -> KvResult<()> {
        match self.state() {
            ConnectivityState::Shutdown => Err(KvError::Closed),
            ConnectivityState::TransientFailure => {
                Err(KvError::Transport("connection in transient failure".to_string()))
            }
            ConnectivityState::Idle | ConnectivityState::Connecting => {
                self.set_state(ConnectivityState::Ready);
                Ok(())
            }
            ConnectivityState::Ready => Ok(()),
        }
    }
}

#[async_trait]
impl KvConnection for InMemoryConnection {
    fn state(&self) -> ConnectivityState {
        ConnectivityState::from_u8(self.state.load(Ordering::SeqCst))
    }

    async fn get(&self, key: &str) -> KvResult<Option<KvEntry>> {
        self.check()?;
        Ok(self.store.get(key))
    }

    async fn get_prefix(&self, prefix: &str) -> KvResult<Vec<KvEntry>> {
        self.check()?;
        Ok(self.store.get_prefix(prefix))
    }

    async fn get_from(&self, start: &str) -> KvResult<Vec<KvEntry>> {
        self.check()?;
        Ok(self.store.get_from(start))
    }

    async fn put(&self, key: &str, value: &str) -> KvResult<()> {
        self.check()?;
        self.store.put(key, value)
    }

    async fn delete(&self, key: &str) -> KvResult<i64> {
        self.check()?;
        self.store.delete(key)
    }

    async fn watch(&self, key: &str) -> KvResult<WatchStream> {
        self.check()?;
        Ok(self.store.watch(key))
    }

    fn close(&self) {
        self.set_state(ConnectivityState::Shutdown);
    }
}

// ============================================================================
// FACTORY
// ============================================================================

#[derive(Debug)]
struct FactoryInner {
    fail_connect: AtomicBool,
    initial_state: AtomicU8,
    connects: AtomicUsize,
}

/// Creates [`InMemoryConnection`] handles onto one shared store.
#[derive(Debug, Clone)]
pub struct InMemoryKvFactory {
    store: InMemoryKvStore,
    inner: Arc<FactoryInner>,
}

impl InMemoryKvFactory {
    pub fn new(store: InMemoryKvStore) -> Self {
        Self {
            store,
            inner: Arc::new(FactoryInner {
                fail_connect: AtomicBool::new(false),
                initial_state: AtomicU8::new(ConnectivityState::Idle as u8),
                connects: AtomicUsize::new(0),
            }),
        }
    }

    pub fn store(&self) -> &InMemoryKvStore {
        &self.store
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.inner.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// State given to handles created from now on.
    pub fn set_initial_state(&self, state: ConnectivityState) {
        self.inner.initial_state.store(state as u8, Ordering::SeqCst);
    }

    /// Number of successful connects so far.
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionFactory for InMemoryKvFactory {
    type Connection = InMemoryConnection;

    async fn connect(&self) -> KvResult<InMemoryConnection> {
        if self.inner.fail_connect.load(Ordering::SeqCst) {
            return Err(KvError::Transport("connection refused".to_string()));
        }
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        let state = ConnectivityState::from_u8(self.inner.initial_state.load(Ordering::SeqCst));
        Ok(InMemoryConnection::new(self.store.clone(), state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_and_revisions() {
        let store = InMemoryKvStore::new();
        store.put("a", "1").unwrap();
        store.put("a", "2").unwrap();
        store.put("b", "1").unwrap();
        let a = store.get("a").unwrap();
        assert_eq!(a.value, "2");
        assert_eq!(a.version, 2);
        assert_eq!(store.revision(), 3);
        assert_eq!(store.delete("a").unwrap(), 1);
        assert_eq!(store.delete("a").unwrap(), 0);
        assert_eq!(store.revision(), 4);
    }

    #[test]
    fn test_prefix_and_from_key_ranges() {
        let store = InMemoryKvStore::new();
        for key in ["app/1", "app/2", "apple", "b", "\u{1}x"] {
            store.put(key, "v").unwrap();
        }
        let keys: Vec<_> = store.get_prefix("app/").into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["app/1", "app/2"]);
        let keys: Vec<_> = store.get_from("\0").into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["\u{1}x", "app/1", "app/2", "apple", "b"]);
        assert_eq!(store.get_from("b").len(), 1);
    }

    #[test]
    fn test_fail_writes() {
        let store = InMemoryKvStore::new();
        store.set_fail_writes(true);
        assert!(matches!(store.put("a", "1"), Err(KvError::Rejected(_))));
        store.set_fail_writes(false);
        assert!(store.put("a", "1").is_ok());
    }

    #[tokio::test]
    async fn test_watch_filters_by_key() {
        let store = InMemoryKvStore::new();
        let mut events = store.watch("target");
        store.put("other", "x").unwrap();
        store.put("target", "y").unwrap();
        store.delete("target").unwrap();
        match events.next().await {
            Some(Ok(WatchEvent::Put(entry))) => assert_eq!(entry.value, "y"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            events.next().await,
            Some(Ok(WatchEvent::Delete {
                key: "target".into()
            }))
        );
    }

    #[tokio::test]
    async fn test_connection_states() {
        let factory = InMemoryKvFactory::new(InMemoryKvStore::new());
        let conn = factory.connect().await.unwrap();
        assert_eq!(conn.state(), ConnectivityState::Idle);
        conn.put("k", "v").await.unwrap();
        assert_eq!(conn.state(), ConnectivityState::Ready);
        conn.set_state(ConnectivityState::TransientFailure);
        assert!(matches!(conn.get("k").await, Err(KvError::Transport(_))));
        conn.close();
        assert_eq!(conn.get("k").await, Err(KvError::Closed));

        factory.set_fail_connect(true);
        assert!(factory.connect().await.is_err());
        assert_eq!(factory.connect_count(), 1);
    }
}
