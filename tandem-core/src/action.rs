//! Action descriptors.
//!
//! An action is a named, stateless recipe for one of the four supported
//! operations. Each entity type publishes its own table of actions; the
//! same action name is interpreted differently by each repository. The SQL
//! backend runs the statement text, the distributed store dispatches on
//! [`ActionKind`] and only looks at the extracted arguments.

use std::fmt;

use chrono::{DateTime, Utc};

// ============================================================================
// ACTION KIND
// ============================================================================

/// The closed set of operations a repository understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// Point lookup by key (multi-result: prefix lookup).
    Select,
    /// Every live record, optionally narrowed by a key prefix.
    GetAll,
    /// Idempotent insert-or-update returning the post-write record.
    Upsert,
    /// Soft delete for SQL, key removal for the distributed store.
    Delete,
}

impl ActionKind {
    /// All kinds, in declaration order.
    pub const ALL: [ActionKind; 4] = [
        ActionKind::Select,
        ActionKind::GetAll,
        ActionKind::Upsert,
        ActionKind::Delete,
    ];

    /// Stable wire name of the action.
    pub fn name(self) -> &'static str {
        match self {
            ActionKind::Select => "select",
            ActionKind::GetAll => "getall",
            ActionKind::Upsert => "upsert",
            ActionKind::Delete => "delete",
        }
    }

    /// Resolve a name case-insensitively. Unknown names yield `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(name.trim()))
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// ARGUMENTS
// ============================================================================

/// A positional statement argument extracted from an entity.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Text(String),
    Bool(Option<bool>),
    Timestamp(DateTime<Utc>),
    OptTimestamp(Option<DateTime<Utc>>),
    Int(Option<i64>),
}

impl ArgValue {
    /// The string payload, if this argument is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Short type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            ArgValue::Text(_) => "text",
            ArgValue::Bool(_) => "bool?",
            ArgValue::Timestamp(_) => "timestamp",
            ArgValue::OptTimestamp(_) => "timestamp?",
            ArgValue::Int(_) => "int?",
        }
    }
}

// ============================================================================
// ACTION
// ============================================================================

/// Argument extractor for one action of entity type `E`.
pub type ArgsFn<E> = fn(&E) -> Vec<ArgValue>;

/// A stateless operation descriptor for entity type `E`.
///
/// Carries the action kind, the parameterized SQL text (positional `$n`
/// placeholders) and the function that extracts the ordered argument list
/// for that statement from an entity.
pub struct Action<E> {
    kind: ActionKind,
    sql: &'static str,
    args: ArgsFn<E>,
}

impl<E> Action<E> {
    pub const fn new(kind: ActionKind, sql: &'static str, args: ArgsFn<E>) -> Self {
        Self { kind, sql, args }
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn sql(&self) -> &'static str {
        self.sql
    }

    /// Extract the statement arguments from `entity`, in placeholder order.
    pub fn args(&self, entity: &E) -> Vec<ArgValue> {
        (self.args)(entity)
    }
}

impl<E> Clone for Action<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for Action<E> {}

impl<E> fmt::Debug for Action<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("kind", &self.kind)
            .field("sql", &self.sql)
            .finish()
    }
}

/// Highest `$n` placeholder index referenced by a statement.
///
/// For every action the value must equal the length of the argument list
/// its extractor returns.
pub fn placeholder_count(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            if end > start {
                if let Ok(n) = sql[start..end].parse::<usize>() {
                    max = max.max(n);
                }
            }
            i = end.max(start);
        } else {
            i += 1;
        }
    }
    max
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_kind_names_round_trip() {
        for kind in ActionKind::ALL {
            assert_eq!(ActionKind::from_name(kind.name()), Some(kind));
        }
    }

    #[test]
    fn test_action_kind_lookup_is_case_insensitive() {
        assert_eq!(ActionKind::from_name("SELECT"), Some(ActionKind::Select));
        assert_eq!(ActionKind::from_name("GetAll"), Some(ActionKind::GetAll));
        assert_eq!(ActionKind::from_name("truncate"), None);
        assert_eq!(ActionKind::from_name(""), None);
    }

    #[test]
    fn test_placeholder_count() {
        assert_eq!(placeholder_count("SELECT 1"), 0);
        assert_eq!(placeholder_count("WHERE key = $1"), 1);
        assert_eq!(placeholder_count("SET a = $2, b = $10 WHERE k = $1"), 10);
        assert_eq!(placeholder_count("SELECT '$' || $3"), 3);
    }

    #[test]
    fn test_arg_value_as_str() {
        assert_eq!(ArgValue::Text("v".into()).as_str(), Some("v"));
        assert_eq!(ArgValue::Bool(Some(true)).as_str(), None);
        assert_eq!(ArgValue::Int(None).type_name(), "int?");
    }
}
