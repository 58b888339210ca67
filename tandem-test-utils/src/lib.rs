//! Tandem Test Utilities
//!
//! Shared test infrastructure for the tandem workspace:
//! - A scripted in-memory repository that mimics either backend
//! - Proptest generators for key/value records
//! - Fixtures wiring the in-memory distributed store
//! - Assertions for repository results

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

pub use tandem_core::{
    Action, ActionKind, AuditAttributes, Backend, Entity, KeyValue, PoolError, RepoError, ScanError, ScanValue,
    ValueScanner,
};
pub use tandem_storage::{Repository, ScanFn};

// ============================================================================
// MOCK REPOSITORY
// ============================================================================

/// One recorded repository call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoCall {
    pub backend: Backend,
    pub action: ActionKind,
    pub key: String,
}

/// Call log that several mocks can share, to check cross-backend ordering.
pub type CallLog = Arc<Mutex<Vec<RepoCall>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory `Repository<KeyValue>` that behaves like the named backend.
///
/// Etcd flavor: hard deletes, per-key version counter, `EtcdNotFound`.
/// Postgres flavor: soft deletes, audit timestamps, `PostgresNoRows`.
/// Failures and latency can be scripted per action.
#[derive(Debug)]
pub struct MockRepository {
    backend: Backend,
    rows: Mutex<BTreeMap<String, KeyValue>>,
    failures: Mutex<HashMap<ActionKind, RepoError>>,
    latency: Mutex<HashMap<ActionKind, Duration>>,
    log: CallLog,
}

impl MockRepository {
    pub fn new(backend: Backend) -> Self {
        Self::with_log(backend, CallLog::default())
    }

    pub fn with_log(backend: Backend, log: CallLog) -> Self {
        Self {
            backend,
            rows: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(HashMap::new()),
            latency: Mutex::new(HashMap::new()),
            log,
        }
    }

    pub fn etcd() -> Self {
        Self::new(Backend::Etcd)
    }

    pub fn postgres() -> Self {
        Self::new(Backend::Postgres)
    }

    /// Make `action` fail with `err` until cleared.
    pub fn fail(&self, action: ActionKind, err: RepoError) {
        lock(&self.failures).insert(action, err);
    }

    /// Make every action fail with `err`.
    pub fn fail_all(&self, err: RepoError) {
        let mut failures = lock(&self.failures);
        for kind in ActionKind::ALL {
            failures.insert(kind, err.clone());
        }
    }

    pub fn clear_failures(&self) {
        lock(&self.failures).clear();
    }

    /// Delay `action` by `delay` before it runs.
    pub fn set_latency(&self, action: ActionKind, delay: Duration) {
        lock(&self.latency).insert(action, delay);
    }

    /// Seed a row directly, bypassing the call log.
    pub fn insert(&self, kv: KeyValue) {
        lock(&self.rows).insert(kv.key.clone(), kv);
    }

    /// Raw stored row, soft-deleted rows included.
    pub fn row(&self, key: &str) -> Option<KeyValue> {
        lock(&self.rows).get(key).cloned()
    }

    pub fn calls(&self) -> Vec<RepoCall> {
        lock(&self.log).clone()
    }

    pub fn call_count(&self, action: ActionKind) -> usize {
        lock(&self.log)
            .iter()
            .filter(|c| c.backend == self.backend && c.action == action)
            .count()
    }

    fn not_found(&self, key: &str) -> RepoError {
        match self.backend {
            Backend::Etcd => RepoError::EtcdNotFound { key: key.to_string() },
            Backend::Postgres => RepoError::PostgresNoRows,
        }
    }

    async fn enter(&self, action: ActionKind, key: &str) -> Result<(), RepoError> {
        lock(&self.log).push(RepoCall {
            backend: self.backend,
            action,
            key: key.to_string(),
        });
        let delay = lock(&self.latency).get(&action).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match lock(&self.failures).get(&action) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn live(&self, kv: &KeyValue) -> bool {
        match self.backend {
            Backend::Etcd => true,
            Backend::Postgres => !kv.audit.is_deleted(),
        }
    }

    fn select(&self, key: &str) -> Result<KeyValue, RepoError> {
        lock(&self.rows)
            .get(key)
            .filter(|kv| self.live(kv))
            .cloned()
            .ok_or_else(|| self.not_found(key))
    }

    fn upsert(&self, kv: &KeyValue) -> KeyValue {
        let mut rows = lock(&self.rows);
        let previous = rows.get(&kv.key).cloned();
        let mut stored = kv.clone();
        match self.backend {
            Backend::Etcd => {
                stored.version = Some(previous.and_then(|p| p.version).unwrap_or(0) + 1);
            }
            Backend::Postgres => {
                stored.version = None;
                stored.audit.deleted = Some(false);
                if let Some(previous) = previous {
                    stored.audit.created_at = previous.audit.created_at;
                    stored.audit.updated_at = Some(kv.audit.updated_at.unwrap_or_else(Utc::now));
                }
            }
        }
        rows.insert(stored.key.clone(), stored.clone());
        match self.backend {
            Backend::Etcd => kv.clone(),
            Backend::Postgres => stored,
        }
    }

    fn delete(&self, kv: &KeyValue) -> Result<KeyValue, RepoError> {
        let mut rows = lock(&self.rows);
        match self.backend {
            Backend::Etcd => {
                rows.remove(&kv.key);
                Ok(kv.clone())
            }
            Backend::Postgres => match rows.get_mut(&kv.key) {
                Some(row) => {
                    row.audit.deleted = Some(true);
                    row.audit.updated_at = Some(kv.audit.updated_at.unwrap_or_else(Utc::now));
                    Ok(row.clone())
                }
                None => Err(RepoError::PostgresNoRows),
            },
        }
    }

    fn rescan(&self, kv: KeyValue, scan: ScanFn<'_, KeyValue>) -> Result<KeyValue, RepoError> {
        let scanner = ValueScanner::new(vec![
            ScanValue::Text(kv.key.clone()),
            ScanValue::Text(kv.value.clone()),
            kv.version.map_or(ScanValue::Null, ScanValue::Int),
            kv.audit.deleted.map_or(ScanValue::Null, ScanValue::Bool),
            ScanValue::Timestamp(kv.audit.created_at),
            kv.audit.updated_at.map_or(ScanValue::Null, ScanValue::Timestamp),
        ]);
        scan(&scanner).map_err(|e| RepoError::scan(self.backend, e))
    }
}

#[async_trait]
impl Repository<KeyValue> for MockRepository {
    fn backend(&self) -> Backend {
        self.backend
    }

    async fn execute(
        &self,
        action: &Action<KeyValue>,
        entity: &KeyValue,
        scan: ScanFn<'_, KeyValue>,
    ) -> Result<KeyValue, RepoError> {
        self.enter(action.kind(), &entity.key).await?;
        match action.kind() {
            ActionKind::Select => {
                let kv = self.select(&entity.key)?;
                self.rescan(kv, scan)
            }
            ActionKind::Upsert => {
                let kv = self.upsert(entity);
                self.rescan(kv, scan)
            }
            ActionKind::Delete => self.delete(entity),
            ActionKind::GetAll => Err(RepoError::UnknownAction {
                backend: self.backend,
                name: action.name().to_string(),
            }),
        }
    }

    async fn execute_many(
        &self,
        action: &Action<KeyValue>,
        entity: &KeyValue,
        scan: ScanFn<'_, KeyValue>,
    ) -> Result<Vec<KeyValue>, RepoError> {
        self.enter(action.kind(), &entity.key).await?;
        if !matches!(action.kind(), ActionKind::Select | ActionKind::GetAll) {
            return Err(RepoError::UnknownAction {
                backend: self.backend,
                name: action.name().to_string(),
            });
        }
        let matching: Vec<KeyValue> = lock(&self.rows)
            .values()
            .filter(|kv| kv.key.starts_with(&entity.key) && self.live(kv))
            .cloned()
            .collect();
        matching.into_iter().map(|kv| self.rescan(kv, scan)).collect()
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for key/value records.

    use super::*;
    use proptest::prelude::*;

    /// Keys as clients typically write them: path-like ASCII.
    pub fn arb_key() -> impl Strategy<Value = String> {
        prop_oneof![
            "[a-z][a-z0-9_-]{0,15}",
            "[a-z]{1,8}(/[a-z0-9]{1,8}){1,3}",
            Just("k".to_string()),
        ]
    }

    /// Arbitrary printable values, empty included.
    pub fn arb_value() -> impl Strategy<Value = String> {
        prop_oneof!["\\PC{0,64}", Just(String::new()), "[0-9]{1,10}",]
    }

    /// Timestamps within 2020-2030.
    pub fn arb_timestamp() -> impl Strategy<Value = chrono::DateTime<Utc>> {
        (1577836800i64..1893456000i64)
            .prop_map(|secs| chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now))
    }

    pub fn arb_key_value() -> impl Strategy<Value = KeyValue> {
        (arb_key(), arb_value(), arb_timestamp()).prop_map(|(key, value, created_at)| KeyValue {
            key,
            value,
            version: None,
            audit: AuditAttributes {
                deleted: Some(false),
                created_at,
                updated_at: None,
            },
        })
    }

    /// Distinct-key batches.
    pub fn arb_key_values(max: usize) -> impl Strategy<Value = Vec<KeyValue>> {
        prop::collection::btree_map(arb_key(), arb_value(), 1..=max.max(1))
            .prop_map(|map| map.into_iter().map(|(k, v)| KeyValue::new(k, v)).collect())
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-wired components over the in-memory distributed store.

    use super::*;
    use tandem_storage::{ClientPool, EtcdInvalidationBus, EtcdRepository, InMemoryKvFactory, InMemoryKvStore};

    /// A live record with a fixed creation time.
    pub fn key_value(key: &str, value: &str) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: value.to_string(),
            version: None,
            audit: AuditAttributes {
                deleted: Some(false),
                created_at: chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default(),
                updated_at: None,
            },
        }
    }

    /// Etcd plumbing over one shared in-memory store.
    pub struct MemoryEtcd {
        pub store: InMemoryKvStore,
        pub factory: InMemoryKvFactory,
        pub pool: ClientPool<InMemoryKvFactory>,
    }

    impl MemoryEtcd {
        pub fn new(capacity: usize) -> Self {
            let store = InMemoryKvStore::new();
            let factory = InMemoryKvFactory::new(store.clone());
            let pool = ClientPool::new(factory.clone(), capacity, Duration::from_millis(200));
            Self { store, factory, pool }
        }

        pub fn repository(&self) -> EtcdRepository<InMemoryKvFactory> {
            EtcdRepository::new(self.pool.clone())
        }

        pub fn bus(&self) -> EtcdInvalidationBus<InMemoryKvFactory> {
            EtcdInvalidationBus::new(self.pool.clone())
        }
    }

    impl Default for MemoryEtcd {
        fn default() -> Self {
            Self::new(8)
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for repository results.

    use super::*;

    /// Assert that a result is either backend's not-found error.
    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &Result<T, RepoError>) {
        match result {
            Err(err) if err.is_not_found() => {}
            other => panic!("Expected not-found, got: {:?}", other),
        }
    }

    /// Assert that a result failed on the given backend.
    #[track_caller]
    pub fn assert_backend_error<T: std::fmt::Debug>(result: &Result<T, RepoError>, backend: Backend) {
        match result {
            Err(err) => assert_eq!(err.backend(), backend, "Wrong backend for {:?}", err),
            Ok(v) => panic!("Expected {} error, got Ok({:?})", backend, v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::assertions::*;
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_mock_postgres_soft_deletes() {
        let repo = MockRepository::postgres();
        repo.execute(&KeyValue::UPSERT, &KeyValue::new("k", "v"), &KeyValue::scan)
            .await
            .unwrap();
        let deleted = repo
            .execute(&KeyValue::DELETE, &KeyValue::with_key("k"), &KeyValue::scan)
            .await
            .unwrap();
        assert_eq!(deleted.audit.deleted, Some(true));
        assert!(repo.row("k").is_some());

        let result = repo
            .execute(&KeyValue::SELECT, &KeyValue::with_key("k"), &KeyValue::scan)
            .await;
        assert_eq!(result, Err(RepoError::PostgresNoRows));

        let again = repo
            .execute(&KeyValue::DELETE, &KeyValue::with_key("k"), &KeyValue::scan)
            .await
            .unwrap();
        assert_eq!(again.audit.deleted, Some(true));
        assert!(again.audit.updated_at >= deleted.audit.updated_at);

        let missing = repo
            .execute(&KeyValue::DELETE, &KeyValue::with_key("never"), &KeyValue::scan)
            .await;
        assert_eq!(missing, Err(RepoError::PostgresNoRows));
    }

    #[tokio::test]
    async fn test_mock_etcd_versions_and_hard_deletes() {
        let repo = MockRepository::etcd();
        for value in ["a", "b"] {
            repo.execute(&KeyValue::UPSERT, &KeyValue::new("k", value), &KeyValue::scan)
                .await
                .unwrap();
        }
        let read = repo
            .execute(&KeyValue::SELECT, &KeyValue::with_key("k"), &KeyValue::scan)
            .await
            .unwrap();
        assert_eq!(read.version, Some(2));
        repo.execute(&KeyValue::DELETE, &KeyValue::with_key("k"), &KeyValue::scan)
            .await
            .unwrap();
        assert!(repo.row("k").is_none());
        assert_not_found(
            &repo
                .execute(&KeyValue::SELECT, &KeyValue::with_key("k"), &KeyValue::scan)
                .await,
        );
    }

    #[tokio::test]
    async fn test_shared_log_and_scripted_failure() {
        let log = CallLog::default();
        let etcd = MockRepository::with_log(Backend::Etcd, log.clone());
        let pg = MockRepository::with_log(Backend::Postgres, log.clone());
        pg.fail(
            ActionKind::Upsert,
            RepoError::backend_failure(Backend::Postgres, "boom"),
        );

        let kv = KeyValue::new("k", "v");
        let _ = pg.execute(&KeyValue::UPSERT, &kv, &KeyValue::scan).await;
        let _ = etcd.execute(&KeyValue::UPSERT, &kv, &KeyValue::scan).await;

        let order: Vec<_> = etcd.calls().into_iter().map(|c| c.backend).collect();
        assert_eq!(order, vec![Backend::Postgres, Backend::Etcd]);
        assert_backend_error(
            &pg.execute(&KeyValue::UPSERT, &kv, &KeyValue::scan).await,
            Backend::Postgres,
        );
        assert_eq!(pg.call_count(ActionKind::Upsert), 2);
    }

    proptest! {
        #[test]
        fn prop_generated_records_are_live(kv in generators::arb_key_value()) {
            prop_assert!(!kv.key.is_empty());
            prop_assert!(!kv.audit.is_deleted());
        }
    }
}
