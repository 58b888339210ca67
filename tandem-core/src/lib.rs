//! Tandem Core - Entity and Action Model
//!
//! Backend-agnostic data types shared by every tandem crate: entities, the
//! actions they publish, the scanner used to materialize records, and the
//! error taxonomy. No I/O lives here.

pub mod action;
pub mod entity;
pub mod error;
pub mod scanner;

pub use action::{placeholder_count, Action, ActionKind, ArgValue, ArgsFn};
pub use entity::{AuditAttributes, Entity, KeyValue, KEY_VALUE_SCHEMA};
pub use error::{Backend, ConfigError, ConnectivityState, PoolError, RepoError, ScanError};
pub use scanner::{ScanSlot, ScanValue, Scanner, ValueScanner};

/// Timestamp type used by audit columns.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
