//! Distributed-store repository
//!
//! Interprets entity actions against etcd. Every call checks one client out
//! of the pool; the guard returns it when the call finishes, on every path.

use async_trait::async_trait;
use tandem_core::{Action, ActionKind, Backend, Entity, RepoError, ScanError, ScanValue, ValueScanner};

use crate::invalidation::CACHE_INVALIDATE_KEY;
use crate::kv::{ConnectionFactory, KvConnection, KvEntry};
use crate::pool::ClientPool;
use crate::{Repository, ScanFn};

/// Sentinel start key that makes a from-key scan cover the whole keyspace.
pub const KEYSPACE_START: &str = "\0";

/// Repository over the distributed key/value store.
pub struct EtcdRepository<F: ConnectionFactory> {
    pool: ClientPool<F>,
}

impl<F: ConnectionFactory> EtcdRepository<F> {
    pub fn new(pool: ClientPool<F>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &ClientPool<F> {
        &self.pool
    }
}

fn scan_entry<E>(scan: ScanFn<'_, E>, entry: &KvEntry) -> Result<E, RepoError> {
    let scanner = ValueScanner::new(vec![
        ScanValue::Text(entry.key.clone()),
        ScanValue::Text(entry.value.clone()),
        ScanValue::Int(entry.version),
    ]);
    scan(&scanner).map_err(|e| RepoError::scan(Backend::Etcd, e))
}

fn unknown<E>(action: &Action<E>) -> RepoError {
    RepoError::UnknownAction {
        backend: Backend::Etcd,
        name: action.name().to_string(),
    }
}

#[async_trait]
impl<E: Entity, F: ConnectionFactory> Repository<E> for EtcdRepository<F> {
    fn backend(&self) -> Backend {
        Backend::Etcd
    }

    async fn execute(&self, action: &Action<E>, entity: &E, scan: ScanFn<'_, E>) -> Result<E, RepoError> {
        let conn = self.pool.acquire().await?;
        let key = entity.key();

        match action.kind() {
            ActionKind::Delete => {
                let deleted = conn.delete(key).await?;
                tracing::debug!(key, deleted, "etcd delete");
                Ok(entity.clone())
            }
            ActionKind::Select => {
                if key == CACHE_INVALIDATE_KEY {
                    return Err(RepoError::EtcdNotFound { key: key.to_string() });
                }
                match conn.get(key).await? {
                    Some(entry) => scan_entry(scan, &entry),
                    None => Err(RepoError::EtcdNotFound { key: key.to_string() }),
                }
            }
            ActionKind::Upsert => {
                let args = action.args(entity);
                let value = match args.get(1) {
                    Some(arg) => arg.as_str().ok_or_else(|| {
                        RepoError::scan(
                            Backend::Etcd,
                            ScanError::ArgumentType {
                                action: action.name(),
                                index: 1,
                                expected: "text",
                                found: arg.type_name(),
                            },
                        )
                    })?,
                    None => {
                        return Err(RepoError::scan(
                            Backend::Etcd,
                            ScanError::MissingDestinations {
                                needed: 2,
                                got: args.len(),
                            },
                        ))
                    }
                };
                conn.put(key, value).await?;
                Ok(entity.clone())
            }
            ActionKind::GetAll => Err(unknown(action)),
        }
    }

    async fn execute_many(
        &self,
        action: &Action<E>,
        entity: &E,
        scan: ScanFn<'_, E>,
    ) -> Result<Vec<E>, RepoError> {
        let conn = self.pool.acquire().await?;
        let key = entity.key();

        let entries = match action.kind() {
            ActionKind::GetAll if key.is_empty() => conn.get_from(KEYSPACE_START).await?,
            ActionKind::GetAll | ActionKind::Select => conn.get_prefix(key).await?,
            ActionKind::Upsert | ActionKind::Delete => return Err(unknown(action)),
        };

        entries
            .iter()
            .filter(|entry| entry.key != CACHE_INVALIDATE_KEY)
            .map(|entry| scan_entry(scan, entry))
            .collect()
    }
}
