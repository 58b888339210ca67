//! Entities
//!
//! An entity is a record type that knows its own key and publishes a table
//! of actions. `KeyValue` is the one entity the service ships with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::action::{Action, ActionKind, ArgValue};
use crate::error::ScanError;
use crate::scanner::{ScanSlot, Scanner};

/// A record type both repositories can operate on.
pub trait Entity: Clone + Send + Sync + 'static {
    /// The record's key (unique within the entity type).
    fn key(&self) -> &str;

    /// Resolve an action by name, case-insensitively.
    fn action(name: &str) -> Option<Action<Self>>;
}

// ============================================================================
// AUDIT ATTRIBUTES
// ============================================================================

/// Audit columns embedded in every relational record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditAttributes {
    #[serde(default)]
    pub deleted: Option<bool>,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl AuditAttributes {
    pub fn is_deleted(&self) -> bool {
        self.deleted.unwrap_or(false)
    }
}

// ============================================================================
// KEY VALUE
// ============================================================================

/// The key/value record served by the API.
///
/// `version` is only populated by the distributed store (its per-key
/// modification count); the relational store always leaves it empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(flatten)]
    pub audit: AuditAttributes,
}

/// DDL for the relational table backing [`KeyValue`].
pub const KEY_VALUE_SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS key_value (
    id          BIGSERIAL PRIMARY KEY,
    key         TEXT NOT NULL UNIQUE,
    value       TEXT NOT NULL,
    deleted     BOOLEAN DEFAULT FALSE,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at  TIMESTAMPTZ
)";

const SELECT_SQL: &str = "\
SELECT key, value, NULL::BIGINT AS version, deleted, created_at, updated_at
  FROM key_value
 WHERE key = $1 AND deleted IS NOT TRUE";

const GETALL_SQL: &str = "\
SELECT key, value, NULL::BIGINT AS version, deleted, created_at, updated_at
  FROM key_value
 WHERE deleted IS NOT TRUE AND ($1 = '' OR starts_with(key, $1))
 ORDER BY key";

const UPSERT_SQL: &str = "\
INSERT INTO key_value (key, value, deleted, created_at, updated_at)
VALUES ($1, $2, COALESCE($3, FALSE), $4, $5)
ON CONFLICT (key) DO UPDATE
   SET value = EXCLUDED.value,
       deleted = EXCLUDED.deleted,
       updated_at = COALESCE(EXCLUDED.updated_at, now())
RETURNING key, value, NULL::BIGINT AS version, deleted, created_at, updated_at";

const DELETE_SQL: &str = "\
UPDATE key_value
   SET deleted = TRUE, updated_at = COALESCE($2, now())
 WHERE key = $1
RETURNING key, value, NULL::BIGINT AS version, deleted, created_at, updated_at";

fn key_arg(kv: &KeyValue) -> Vec<ArgValue> {
    vec![ArgValue::Text(kv.key.clone())]
}

fn upsert_args(kv: &KeyValue) -> Vec<ArgValue> {
    vec![
        ArgValue::Text(kv.key.clone()),
        ArgValue::Text(kv.value.clone()),
        ArgValue::Bool(kv.audit.deleted),
        ArgValue::Timestamp(kv.audit.created_at),
        ArgValue::OptTimestamp(kv.audit.updated_at),
    ]
}

fn delete_args(kv: &KeyValue) -> Vec<ArgValue> {
    vec![
        ArgValue::Text(kv.key.clone()),
        ArgValue::OptTimestamp(kv.audit.updated_at),
    ]
}

impl KeyValue {
    pub const SELECT: Action<KeyValue> = Action::new(ActionKind::Select, SELECT_SQL, key_arg);
    pub const GETALL: Action<KeyValue> = Action::new(ActionKind::GetAll, GETALL_SQL, key_arg);
    pub const UPSERT: Action<KeyValue> = Action::new(ActionKind::Upsert, UPSERT_SQL, upsert_args);
    pub const DELETE: Action<KeyValue> = Action::new(ActionKind::Delete, DELETE_SQL, delete_args);

    /// Every action, in [`ActionKind::ALL`] order.
    pub const ACTIONS: [Action<KeyValue>; 4] =
        [Self::SELECT, Self::GETALL, Self::UPSERT, Self::DELETE];

    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ..Self::default()
        }
    }

    /// A record carrying only a key, for lookups and deletes.
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    /// Fill a record from a scanner in the fixed column order
    /// `key, value, version, deleted, created_at, updated_at`.
    pub fn scan(scanner: &dyn Scanner) -> Result<Self, ScanError> {
        let mut kv = KeyValue::default();
        let KeyValue {
            key,
            value,
            version,
            audit,
        } = &mut kv;
        scanner.scan(&mut [
            ScanSlot::Text(key),
            ScanSlot::Text(value),
            ScanSlot::OptInt(version),
            ScanSlot::OptBool(&mut audit.deleted),
            ScanSlot::Timestamp(&mut audit.created_at),
            ScanSlot::OptTimestamp(&mut audit.updated_at),
        ])?;
        Ok(kv)
    }
}

impl Entity for KeyValue {
    fn key(&self) -> &str {
        &self.key
    }

    fn action(name: &str) -> Option<Action<Self>> {
        let kind = ActionKind::from_name(name)?;
        Self::ACTIONS.into_iter().find(|a| a.kind() == kind)
    }
}
