//! Distributed-store access
//!
//! [`KvConnection`] is the narrow surface the pool, the etcd repository and
//! the invalidation bus need from a distributed key/value store. The
//! production implementation wraps `etcd-client`; an in-process store lives
//! in [`crate::memory_kv`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, EventType, GetOptions};
use futures_util::stream::{self, BoxStream, StreamExt};
use tandem_core::{Backend, ConfigError, ConnectivityState, RepoError};
use thiserror::Error;

// ============================================================================
// TYPES
// ============================================================================

/// One record read from the distributed store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: String,
    /// Per-key modification count, starting at 1 on creation.
    pub version: i64,
    pub mod_revision: i64,
}

/// A change observed on a watched key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put(KvEntry),
    Delete { key: String },
}

/// Errors from the distributed-store client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    #[error("connection is closed")]
    Closed,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("key or value is not valid UTF-8")]
    Utf8,

    #[error("write rejected: {0}")]
    Rejected(String),
}

pub type KvResult<T> = Result<T, KvError>;

/// Stream of watch events for one key.
pub type WatchStream = BoxStream<'static, KvResult<WatchEvent>>;

impl From<KvError> for RepoError {
    fn from(err: KvError) -> Self {
        RepoError::backend_failure(Backend::Etcd, err.to_string())
    }
}

// ============================================================================
// TRAITS
// ============================================================================

/// A single client handle to the distributed store.
#[async_trait]
pub trait KvConnection: Send + Sync + 'static {
    /// Current connectivity state of the handle.
    fn state(&self) -> ConnectivityState;

    /// Exact-key lookup.
    async fn get(&self, key: &str) -> KvResult<Option<KvEntry>>;

    /// All keys starting with `prefix`, in key order.
    async fn get_prefix(&self, prefix: &str) -> KvResult<Vec<KvEntry>>;

    /// All keys `>= start`, in key order.
    async fn get_from(&self, start: &str) -> KvResult<Vec<KvEntry>>;

    async fn put(&self, key: &str, value: &str) -> KvResult<()>;

    /// Remove `key`, returning the number of keys deleted.
    async fn delete(&self, key: &str) -> KvResult<i64>;

    /// Watch `key` for changes. The stream ends when the watch is cancelled.
    async fn watch(&self, key: &str) -> KvResult<WatchStream>;

    /// Release the handle. Subsequent calls fail with [`KvError::Closed`].
    fn close(&self);
}

/// Creates new client handles.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: KvConnection;

    async fn connect(&self) -> KvResult<Self::Connection>;
}

// ============================================================================
// ETCD CONFIGURATION
// ============================================================================

/// Distributed-store client configuration.
#[derive(Debug, Clone)]
pub struct EtcdConfig {
    /// Cluster endpoints (`host:port`)
    pub endpoints: Vec<String>,
    /// Connection establishment timeout
    pub dial_timeout: Duration,
    /// Pool capacity is `pool_multiplier` times available parallelism
    pub pool_multiplier: usize,
    /// Maximum wait for a pooled client
    pub acquire_timeout: Duration,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["localhost:2379".to_string()],
            dial_timeout: Duration::from_secs(5),
            pool_multiplier: 50,
            acquire_timeout: Duration::from_millis(500),
        }
    }
}

impl EtcdConfig {
    /// Load from `TANDEM_ETCD_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let endpoints = match std::env::var("TANDEM_ETCD_ENDPOINTS") {
            Ok(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            Err(_) => defaults.endpoints,
        };
        let config = Self {
            endpoints,
            dial_timeout: env_millis("TANDEM_ETCD_DIAL_TIMEOUT_MS")?.unwrap_or(defaults.dial_timeout),
            pool_multiplier: std::env::var("TANDEM_ETCD_POOL_MULTIPLIER")
                .ok()
                .map(|s| {
                    s.parse()
                        .map_err(|_| ConfigError::invalid("TANDEM_ETCD_POOL_MULTIPLIER", s))
                })
                .transpose()?
                .unwrap_or(defaults.pool_multiplier),
            acquire_timeout: env_millis("TANDEM_ETCD_ACQUIRE_TIMEOUT_MS")?
                .unwrap_or(defaults.acquire_timeout),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "TANDEM_ETCD_ENDPOINTS".to_string(),
            });
        }
        if self.pool_multiplier == 0 {
            return Err(ConfigError::invalid("TANDEM_ETCD_POOL_MULTIPLIER", "must be > 0"));
        }
        Ok(())
    }

    /// `pool_multiplier` × available parallelism.
    pub fn pool_capacity(&self) -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.pool_multiplier.saturating_mul(cpus).max(1)
    }
}

pub(crate) fn env_millis(name: &str) -> Result<Option<Duration>, ConfigError> {
    std::env::var(name)
        .ok()
        .map(|s| {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| ConfigError::invalid(name, s))
        })
        .transpose()
}

// ============================================================================
// ETCD CONNECTION
// ============================================================================

/// A client handle backed by `etcd-client`.
pub struct EtcdConnection {
    client: Client,
    state: AtomicU8,
}

impl EtcdConnection {
    fn new(client: Client) -> Self {
        Self {
            client,
            state: AtomicU8::new(ConnectivityState::Idle as u8),
        }
    }

    fn set_state(&self, next: ConnectivityState) {
        let shutdown = ConnectivityState::Shutdown as u8;
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (cur != shutdown).then_some(next as u8)
            });
    }

    fn client(&self) -> KvResult<Client> {
        if self.state() == ConnectivityState::Shutdown {
            return Err(KvError::Closed);
        }
        Ok(self.client.clone())
    }

    fn observe<T>(&self, result: Result<T, etcd_client::Error>) -> KvResult<T> {
        match result {
            Ok(value) => {
                self.set_state(ConnectivityState::Ready);
                Ok(value)
            }
            Err(err) if is_transient(&err) => {
                self.set_state(ConnectivityState::TransientFailure);
                Err(KvError::Transport(err.to_string()))
            }
            Err(err) => Err(KvError::Request(err.to_string())),
        }
    }

    async fn range(&self, key: &str, options: GetOptions) -> KvResult<Vec<KvEntry>> {
        let mut client = self.client()?;
        let resp = self.observe(client.get(key, Some(options)).await)?;
        resp.kvs().iter().map(entry_from).collect()
    }
}

fn is_transient(err: &etcd_client::Error) -> bool {
    match err {
        etcd_client::Error::TransportError(_) | etcd_client::Error::IoError(_) => true,
        etcd_client::Error::GRpcStatus(status) => matches!(
            format!("{:?}", status.code()).as_str(),
            "Unavailable" | "DeadlineExceeded"
        ),
        _ => false,
    }
}

fn entry_from(kv: &etcd_client::KeyValue) -> KvResult<KvEntry> {
    Ok(KvEntry {
        key: kv.key_str().map_err(|_| KvError::Utf8)?.to_string(),
        value: kv.value_str().map_err(|_| KvError::Utf8)?.to_string(),
        version: kv.version(),
        mod_revision: kv.mod_revision(),
    })
}

#[async_trait]
impl KvConnection for EtcdConnection {
    fn state(&self) -> ConnectivityState {
        ConnectivityState::from_u8(self.state.load(Ordering::Acquire))
    }

    async fn get(&self, key: &str) -> KvResult<Option<KvEntry>> {
        let mut client = self.client()?;
        let resp = self.observe(client.get(key, None).await)?;
        resp.kvs().first().map(entry_from).transpose()
    }

    async fn get_prefix(&self, prefix: &str) -> KvResult<Vec<KvEntry>> {
        self.range(prefix, GetOptions::new().with_prefix()).await
    }

    async fn get_from(&self, start: &str) -> KvResult<Vec<KvEntry>> {
        self.range(start, GetOptions::new().with_from_key()).await
    }

    async fn put(&self, key: &str, value: &str) -> KvResult<()> {
        let mut client = self.client()?;
        self.observe(client.put(key, value, None).await).map(|_| ())
    }

    async fn delete(&self, key: &str) -> KvResult<i64> {
        let mut client = self.client()?;
        let resp = self.observe(client.delete(key, None).await)?;
        Ok(resp.deleted())
    }

    async fn watch(&self, key: &str) -> KvResult<WatchStream> {
        let mut client = self.client()?;
        let (watcher, inbound) = self.observe(client.watch(key, None).await)?;

        // The watcher is carried in the stream state; dropping it cancels the watch.
        let state = (watcher, inbound, VecDeque::new(), false);
        let events = stream::unfold(state, |(watcher, mut inbound, mut pending, done)| async move {
            loop {
                if let Some(event) = pending.pop_front() {
                    return Some((Ok(event), (watcher, inbound, pending, done)));
                }
                if done {
                    return None;
                }
                match inbound.message().await {
                    Ok(Some(resp)) => {
                        for event in resp.events() {
                            let Some(kv) = event.kv() else { continue };
                            let converted = match event.event_type() {
                                EventType::Put => entry_from(kv).map(WatchEvent::Put),
                                EventType::Delete => kv
                                    .key_str()
                                    .map(|k| WatchEvent::Delete { key: k.to_string() })
                                    .map_err(|_| KvError::Utf8),
                            };
                            match converted {
                                Ok(ev) => pending.push_back(ev),
                                Err(err) => tracing::warn!(error = %err, "Skipping undecodable watch event"),
                            }
                        }
                        if resp.canceled() {
                            return pending
                                .pop_front()
                                .map(|ev| (Ok(ev), (watcher, inbound, pending, true)));
                        }
                    }
                    Ok(None) => return None,
                    Err(err) => {
                        return Some((
                            Err(KvError::Transport(err.to_string())),
                            (watcher, inbound, pending, true),
                        ))
                    }
                }
            }
        });
        Ok(events.boxed())
    }

    fn close(&self) {
        self.state
            .store(ConnectivityState::Shutdown as u8, Ordering::Release);
    }
}

/// Connects new [`EtcdConnection`] handles.
#[derive(Debug, Clone)]
pub struct EtcdConnectionFactory {
    config: EtcdConfig,
}

impl EtcdConnectionFactory {
    pub fn new(config: EtcdConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EtcdConfig {
        &self.config
    }
}

#[async_trait]
impl ConnectionFactory for EtcdConnectionFactory {
    type Connection = EtcdConnection;

    async fn connect(&self) -> KvResult<EtcdConnection> {
        let options = ConnectOptions::new().with_connect_timeout(self.config.dial_timeout);
        let client = Client::connect(&self.config.endpoints, Some(options))
            .await
            .map_err(|e| KvError::Transport(e.to_string()))?;
        tracing::debug!(endpoints = ?self.config.endpoints, "Connected etcd client");
        Ok(EtcdConnection::new(client))
    }
}
