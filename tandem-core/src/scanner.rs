//! Scanner abstraction
//!
//! A scanner copies one backend record into caller-provided typed
//! destinations, in positional order. Repositories hand a scanner to the
//! caller's scan callback; the callback owns the mapping from positions to
//! entity fields.

use chrono::{DateTime, Utc};

use crate::error::ScanError;

/// A typed mutable destination for one scanned column.
#[derive(Debug)]
pub enum ScanSlot<'a> {
    Text(&'a mut String),
    OptBool(&'a mut Option<bool>),
    Timestamp(&'a mut DateTime<Utc>),
    OptTimestamp(&'a mut Option<DateTime<Utc>>),
    OptInt(&'a mut Option<i64>),
}

impl ScanSlot<'_> {
    /// Type name used in mismatch errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            ScanSlot::Text(_) => "text",
            ScanSlot::OptBool(_) => "bool?",
            ScanSlot::Timestamp(_) => "timestamp",
            ScanSlot::OptTimestamp(_) => "timestamp?",
            ScanSlot::OptInt(_) => "int?",
        }
    }
}

/// Fills destinations from one backend record.
pub trait Scanner {
    /// Copy the record's columns into `dest`, position by position.
    ///
    /// Destinations beyond the record's column count are left untouched.
    /// Fewer destinations than columns is an error.
    fn scan(&self, dest: &mut [ScanSlot<'_>]) -> Result<(), ScanError>;
}

/// A column value held by an in-memory scanner.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanValue {
    Text(String),
    Bool(bool),
    Int(i64),
    Timestamp(DateTime<Utc>),
    Null,
}

impl ScanValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ScanValue::Text(_) => "text",
            ScanValue::Bool(_) => "bool",
            ScanValue::Int(_) => "int",
            ScanValue::Timestamp(_) => "timestamp",
            ScanValue::Null => "null",
        }
    }

    fn write_into(&self, index: usize, slot: &mut ScanSlot<'_>) -> Result<(), ScanError> {
        match (slot, self) {
            (ScanSlot::Text(dst), ScanValue::Text(v)) => dst.clone_from(v),
            (ScanSlot::OptBool(dst), ScanValue::Bool(v)) => **dst = Some(*v),
            (ScanSlot::OptBool(dst), ScanValue::Null) => **dst = None,
            (ScanSlot::Timestamp(dst), ScanValue::Timestamp(v)) => **dst = *v,
            (ScanSlot::OptTimestamp(dst), ScanValue::Timestamp(v)) => **dst = Some(*v),
            (ScanSlot::OptTimestamp(dst), ScanValue::Null) => **dst = None,
            (ScanSlot::OptInt(dst), ScanValue::Int(v)) => **dst = Some(*v),
            (ScanSlot::OptInt(dst), ScanValue::Null) => **dst = None,
            (slot, value) => {
                return Err(ScanError::TypeMismatch {
                    index,
                    expected: slot.type_name(),
                    found: value.type_name(),
                })
            }
        }
        Ok(())
    }
}

/// Scanner over an owned list of column values.
///
/// Used by the distributed-store repository (key, value, version) and by
/// tests that need a scanner without a backend.
#[derive(Debug, Clone, Default)]
pub struct ValueScanner {
    values: Vec<ScanValue>,
}

impl ValueScanner {
    pub fn new(values: Vec<ScanValue>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Scanner for ValueScanner {
    fn scan(&self, dest: &mut [ScanSlot<'_>]) -> Result<(), ScanError> {
        if dest.len() < self.values.len() {
            return Err(ScanError::MissingDestinations {
                needed: self.values.len(),
                got: dest.len(),
            });
        }
        for (index, (value, slot)) in self.values.iter().zip(dest.iter_mut()).enumerate() {
            value.write_into(index, slot)?;
        }
        Ok(())
    }
}
