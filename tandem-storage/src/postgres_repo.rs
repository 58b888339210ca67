//! Relational repository
//!
//! Runs an action's SQL against PostgreSQL through a `deadpool-postgres`
//! pool. Connection acquisition is retried with linear backoff; statement
//! execution is not retried.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Object, Pool, PoolConfig, RecyclingMethod, Runtime};
use tandem_core::{Action, ArgValue, Backend, ConfigError, Entity, RepoError, ScanError, ScanSlot, Scanner};
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};

use crate::kv::env_millis;
use crate::{Repository, ScanFn};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Database connection pool configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Full connection URL; overrides the discrete fields when set
    pub url: Option<String>,
    /// PostgreSQL host
    pub host: String,
    /// PostgreSQL port
    pub port: u16,
    /// Database name
    pub dbname: String,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// Maximum pool size
    pub max_size: usize,
    /// Wait timeout for a pooled connection
    pub timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 5432,
            dbname: "tandem".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            max_size: 16,
            timeout: Duration::from_secs(30),
        }
    }
}

impl DbConfig {
    /// Load from `TANDEM_DB_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("TANDEM_DATABASE_URL").ok().filter(|s| !s.is_empty()),
            host: std::env::var("TANDEM_DB_HOST").unwrap_or(defaults.host),
            port: std::env::var("TANDEM_DB_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            dbname: std::env::var("TANDEM_DB_NAME").unwrap_or(defaults.dbname),
            user: std::env::var("TANDEM_DB_USER").unwrap_or(defaults.user),
            password: std::env::var("TANDEM_DB_PASSWORD").unwrap_or_default(),
            max_size: std::env::var("TANDEM_DB_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_size),
            timeout: Duration::from_secs(
                std::env::var("TANDEM_DB_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.timeout.as_secs()),
            ),
        }
    }

    /// Create a connection pool from this configuration.
    ///
    /// Connections are opened lazily, so this succeeds without a reachable
    /// database.
    pub fn create_pool(&self) -> Result<Pool, RepoError> {
        let mut cfg = Config::new();
        match &self.url {
            Some(url) => cfg.url = Some(url.clone()),
            None => {
                cfg.host = Some(self.host.clone());
                cfg.port = Some(self.port);
                cfg.dbname = Some(self.dbname.clone());
                cfg.user = Some(self.user.clone());
                cfg.password = Some(self.password.clone());
            }
        }
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        let mut pool_cfg = PoolConfig::new(self.max_size.max(1));
        pool_cfg.timeouts.wait = Some(self.timeout);
        pool_cfg.timeouts.create = Some(self.timeout);
        cfg.pool = Some(pool_cfg);

        cfg.create_pool(Some(Runtime::Tokio1), NoTls).map_err(|e| {
            RepoError::backend_failure(Backend::Postgres, format!("Failed to create pool: {}", e))
        })
    }
}

/// Connection-acquire retry policy.
///
/// Attempt `n` (1-based, after the first) sleeps `unit * increase * (n - 1)`
/// first; `tries` bounds the total number of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub tries: u32,
    pub increase: u32,
    pub unit: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            tries: 3,
            increase: 1,
            unit: Duration::from_secs(1),
        }
    }
}

impl RetryConfig {
    /// Load from `TANDEM_RETRY_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let parse = |name: &str, default: u32| -> Result<u32, ConfigError> {
            match std::env::var(name) {
                Ok(raw) => raw.parse().map_err(|_| ConfigError::invalid(name, raw)),
                Err(_) => Ok(default),
            }
        };
        let config = Self {
            tries: parse("TANDEM_RETRY_TRIES", defaults.tries)?,
            increase: parse("TANDEM_RETRY_INCREASE", defaults.increase)?,
            unit: env_millis("TANDEM_RETRY_UNIT_MS")?.unwrap_or(defaults.unit),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tries == 0 {
            return Err(ConfigError::invalid("TANDEM_RETRY_TRIES", "must be > 0"));
        }
        if self.increase == 0 {
            return Err(ConfigError::invalid("TANDEM_RETRY_INCREASE", "must be > 0"));
        }
        Ok(())
    }

    /// Sleeps taken before each retry, in order.
    pub fn delays(&self) -> Vec<Duration> {
        let increase = u64::from(self.increase.max(1));
        (1..self.tries)
            .map(|step| {
                let factor = u32::try_from(u64::from(step) * increase).unwrap_or(u32::MAX);
                self.unit.saturating_mul(factor)
            })
            .collect()
    }
}

// ============================================================================
// SCANNER
// ============================================================================

/// Scanner over one result row.
pub struct RowScanner<'a> {
    row: &'a Row,
}

impl<'a> RowScanner<'a> {
    pub fn new(row: &'a Row) -> Self {
        Self { row }
    }
}

fn column<'r, T: tokio_postgres::types::FromSql<'r>>(row: &'r Row, index: usize) -> Result<T, ScanError> {
    row.try_get(index).map_err(|e| ScanError::Column {
        index,
        reason: e.to_string(),
    })
}

impl Scanner for RowScanner<'_> {
    fn scan(&self, dest: &mut [ScanSlot<'_>]) -> Result<(), ScanError> {
        let columns = self.row.len();
        if dest.len() < columns {
            return Err(ScanError::MissingDestinations {
                needed: columns,
                got: dest.len(),
            });
        }
        for (index, slot) in dest.iter_mut().take(columns).enumerate() {
            match slot {
                ScanSlot::Text(d) => **d = column(self.row, index)?,
                ScanSlot::OptBool(d) => **d = column(self.row, index)?,
                ScanSlot::Timestamp(d) => **d = column(self.row, index)?,
                ScanSlot::OptTimestamp(d) => **d = column(self.row, index)?,
                ScanSlot::OptInt(d) => **d = column(self.row, index)?,
            }
        }
        Ok(())
    }
}

fn sql_param(arg: &ArgValue) -> &(dyn ToSql + Sync) {
    match arg {
        ArgValue::Text(v) => v,
        ArgValue::Bool(v) => v,
        ArgValue::Timestamp(v) => v,
        ArgValue::OptTimestamp(v) => v,
        ArgValue::Int(v) => v,
    }
}

// ============================================================================
// REPOSITORY
// ============================================================================

/// Repository over PostgreSQL.
#[derive(Clone)]
pub struct PostgresRepository {
    pool: Option<Pool>,
    retry: RetryConfig,
}

impl PostgresRepository {
    pub fn new(pool: Pool, retry: RetryConfig) -> Self {
        Self {
            pool: Some(pool),
            retry,
        }
    }

    /// A repository with no pool; every call fails with [`RepoError::BadPool`].
    pub fn without_pool() -> Self {
        Self {
            pool: None,
            retry: RetryConfig::default(),
        }
    }

    pub fn pool(&self) -> Option<&Pool> {
        self.pool.as_ref()
    }

    async fn client(&self) -> Result<Object, RepoError> {
        let pool = self.pool.as_ref().ok_or(RepoError::BadPool)?;
        let mut attempts = 1u32;
        let mut result = pool.get().await;
        for delay in self.retry.delays() {
            let Err(err) = &result else { break };
            tokio::time::sleep(delay).await;
            tracing::warn!(attempt = attempts + 1, error = %err, "Retry pool acquire");
            attempts += 1;
            result = pool.get().await;
        }
        result.map_err(|e| RepoError::Connect {
            backend: Backend::Postgres,
            attempts,
            reason: e.to_string(),
        })
    }
}

fn pg_error(err: tokio_postgres::Error) -> RepoError {
    RepoError::backend_failure(Backend::Postgres, err.to_string())
}

fn scan_row<E>(scan: ScanFn<'_, E>, row: &Row) -> Result<E, RepoError> {
    scan(&RowScanner::new(row)).map_err(|e| RepoError::scan(Backend::Postgres, e))
}

#[async_trait]
impl<E: Entity> Repository<E> for PostgresRepository {
    fn backend(&self) -> Backend {
        Backend::Postgres
    }

    async fn execute(&self, action: &Action<E>, entity: &E, scan: ScanFn<'_, E>) -> Result<E, RepoError> {
        let client = self.client().await?;
        let args = action.args(entity);
        let params: Vec<&(dyn ToSql + Sync)> = args.iter().map(sql_param).collect();
        let stmt = client.prepare_cached(action.sql()).await.map_err(pg_error)?;
        match client.query_opt(&stmt, &params).await.map_err(pg_error)? {
            Some(row) => scan_row(scan, &row),
            None => Err(RepoError::PostgresNoRows),
        }
    }

    async fn execute_many(
        &self,
        action: &Action<E>,
        entity: &E,
        scan: ScanFn<'_, E>,
    ) -> Result<Vec<E>, RepoError> {
        let client = self.client().await?;
        let args = action.args(entity);
        let params: Vec<&(dyn ToSql + Sync)> = args.iter().map(sql_param).collect();
        let stmt = client.prepare_cached(action.sql()).await.map_err(pg_error)?;
        let rows = client.query(&stmt, &params).await.map_err(pg_error)?;
        rows.iter().map(|row| scan_row(scan, row)).collect()
    }
}
