//! Error types for tandem operations

use std::fmt;
use std::time::Duration;

use thiserror::Error;

// ============================================================================
// BACKEND IDENTITY
// ============================================================================

/// Which store an error or result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    Etcd,
    Postgres,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Etcd => "etcd",
            Backend::Postgres => "postgres",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// CONNECTIVITY
// ============================================================================

/// Connectivity state of a distributed-store client handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectivityState {
    Idle = 0,
    Connecting = 1,
    Ready = 2,
    TransientFailure = 3,
    Shutdown = 4,
}

impl ConnectivityState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectivityState::Idle => "IDLE",
            ConnectivityState::Connecting => "CONNECTING",
            ConnectivityState::Ready => "READY",
            ConnectivityState::TransientFailure => "TRANSIENT_FAILURE",
            ConnectivityState::Shutdown => "SHUTDOWN",
        }
    }

    /// Decode the `repr(u8)` form. Out-of-range values map to `Shutdown`.
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectivityState::Idle,
            1 => ConnectivityState::Connecting,
            2 => ConnectivityState::Ready,
            3 => ConnectivityState::TransientFailure,
            _ => ConnectivityState::Shutdown,
        }
    }

    /// Whether the pool may hand out a handle in this state.
    pub fn is_usable(self) -> bool {
        matches!(
            self,
            ConnectivityState::Idle | ConnectivityState::Connecting | ConnectivityState::Ready
        )
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Errors produced while copying a record into typed destinations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScanError {
    #[error("scan needs {needed} destinations, got {got}")]
    MissingDestinations { needed: usize, got: usize },

    #[error("column {index}: expected {expected}, found {found}")]
    TypeMismatch {
        index: usize,
        expected: &'static str,
        found: &'static str,
    },

    #[error("action {action}: argument {index} must be {expected}, got {found}")]
    ArgumentType {
        action: &'static str,
        index: usize,
        expected: &'static str,
        found: &'static str,
    },

    #[error("column {index}: {reason}")]
    Column { index: usize, reason: String },
}

/// Client pool errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("client pool is closed")]
    Closed,

    #[error("client connection is in bad state: {state}")]
    BadState { state: ConnectivityState },

    #[error("timed out after {waited:?} waiting for a pooled client")]
    Timeout { waited: Duration },

    #[error("failed to create client: {reason}")]
    Create { reason: String },

    #[error("no usable client after {capacity} attempts")]
    Exhausted { capacity: usize },
}

/// Repository errors. Every variant can name the backend it came from.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepoError {
    #[error("etcd: no Kvs for key {key:?}")]
    EtcdNotFound { key: String },

    #[error("postgres: no rows in result set")]
    PostgresNoRows,

    #[error("postgres: bad pool")]
    BadPool,

    #[error("etcd pool: {0}")]
    Pool(#[from] PoolError),

    #[error("{backend}: connect failed after {attempts} attempts: {reason}")]
    Connect {
        backend: Backend,
        attempts: u32,
        reason: String,
    },

    #[error("{backend}: scan failed: {source}")]
    Scan {
        backend: Backend,
        #[source]
        source: ScanError,
    },

    #[error("{backend}: unknown action {name:?}")]
    UnknownAction { backend: Backend, name: String },

    #[error("{backend}: {message}")]
    Backend { backend: Backend, message: String },
}

impl RepoError {
    /// The backend the error originated from.
    pub fn backend(&self) -> Backend {
        match self {
            RepoError::EtcdNotFound { .. } | RepoError::Pool(_) => Backend::Etcd,
            RepoError::PostgresNoRows | RepoError::BadPool => Backend::Postgres,
            RepoError::Connect { backend, .. }
            | RepoError::Scan { backend, .. }
            | RepoError::UnknownAction { backend, .. }
            | RepoError::Backend { backend, .. } => *backend,
        }
    }

    /// True for either backend's "record absent" outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RepoError::EtcdNotFound { .. } | RepoError::PostgresNoRows)
    }

    pub fn scan(backend: Backend, source: ScanError) -> Self {
        RepoError::Scan { backend, source }
    }

    pub fn backend_failure(backend: Backend, message: impl Into<String>) -> Self {
        RepoError::Backend {
            backend,
            message: message.into(),
        }
    }
}

/// Configuration errors raised by `from_env` loaders.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required config: {field}")]
    MissingRequired { field: String },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_state_names() {
        assert_eq!(ConnectivityState::TransientFailure.to_string(), "TRANSIENT_FAILURE");
        assert_eq!(ConnectivityState::Shutdown.to_string(), "SHUTDOWN");
        for state in [
            ConnectivityState::Idle,
            ConnectivityState::Connecting,
            ConnectivityState::Ready,
            ConnectivityState::TransientFailure,
            ConnectivityState::Shutdown,
        ] {
            assert_eq!(ConnectivityState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_bad_state_message_names_state() {
        let err = PoolError::BadState {
            state: ConnectivityState::Shutdown,
        };
        assert_eq!(err.to_string(), "client connection is in bad state: SHUTDOWN");
    }

    #[test]
    fn test_not_found_variants_stay_distinct() {
        let etcd = RepoError::EtcdNotFound { key: "a".into() };
        let pg = RepoError::PostgresNoRows;
        assert!(etcd.is_not_found());
        assert!(pg.is_not_found());
        assert_ne!(etcd, pg);
        assert_eq!(etcd.backend(), Backend::Etcd);
        assert_eq!(pg.backend(), Backend::Postgres);
        assert!(!RepoError::BadPool.is_not_found());
    }

    #[test]
    fn test_pool_error_is_attributed_to_etcd() {
        let err: RepoError = PoolError::Closed.into();
        assert_eq!(err.backend(), Backend::Etcd);
        assert_eq!(err.to_string(), "etcd pool: client pool is closed");
    }
}
