//! Type definitions for the store clients
//!
//! Every logical table has a closed set of fields (a `TableField` enum) but
//! records travel through the key-value store as generic
//! `field name -> JSON value` maps.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// A key-value record: field name to JSON value
pub type Record = BTreeMap<String, Value>;

/// Logical tables held in the key-value store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    /// Request ledger entries keyed by request id
    Requests,
    /// Content-hash cache entries
    Cache,
    /// Lease records keyed by resource
    Locks,
    /// Output array counters and schemas keyed by array name
    Arrays,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Requests => "requests",
            Table::Cache => "cache",
            Table::Locks => "locks",
            Table::Arrays => "arrays",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A field of one logical table
pub trait TableField: Copy + fmt::Debug + Send + Sync + 'static {
    /// Table this field belongs to
    const TABLE: Table;

    /// Stored attribute name
    fn name(self) -> &'static str;
}

/// Build a record from typed fields
pub fn record<F, I>(fields: I) -> Record
where
    F: TableField,
    I: IntoIterator<Item = (F, Value)>,
{
    fields
        .into_iter()
        .map(|(field, value)| (field.name().to_string(), value))
        .collect()
}

/// Typed accessors over a generic record
pub trait RecordExt {
    fn field<F: TableField>(&self, field: F) -> Option<&Value>;

    fn u64_field<F: TableField>(&self, field: F) -> u64 {
        self.field(field).and_then(Value::as_u64).unwrap_or(0)
    }

    fn i64_field<F: TableField>(&self, field: F) -> Option<i64> {
        self.field(field).and_then(Value::as_i64)
    }

    fn str_field<F: TableField>(&self, field: F) -> Option<&str> {
        self.field(field).and_then(Value::as_str)
    }

    fn bool_field<F: TableField>(&self, field: F) -> bool {
        self.field(field).and_then(Value::as_bool).unwrap_or(false)
    }
}

impl RecordExt for Record {
    fn field<F: TableField>(&self, field: F) -> Option<&Value> {
        self.get(field.name()).filter(|v| !v.is_null())
    }
}

/// Precondition for a conditional write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    /// The record must not exist
    NotExists,
    /// The record must exist
    Exists,
    /// The field must hold exactly this value; `null` also matches a missing field
    FieldEquals { field: String, value: Value },
    /// Every nested condition must hold
    All { conditions: Vec<Condition> },
}

impl Condition {
    pub fn field_equals<F: TableField>(field: F, value: impl Into<Value>) -> Self {
        Condition::FieldEquals {
            field: field.name().to_string(),
            value: value.into(),
        }
    }

    pub fn all(conditions: Vec<Condition>) -> Self {
        Condition::All { conditions }
    }

    /// Evaluate the condition against the currently stored record
    pub fn evaluate(&self, current: Option<&Record>) -> bool {
        match self {
            Condition::NotExists => current.is_none(),
            Condition::Exists => current.is_some(),
            Condition::FieldEquals { field, value } => {
                let Some(record) = current else {
                    return false;
                };
                match record.get(field) {
                    Some(stored) => stored == value,
                    None => value.is_null(),
                }
            }
            Condition::All { conditions } => conditions.iter().all(|c| c.evaluate(current)),
        }
    }
}

/// Apply a set of changes onto a record; `null` values remove the field
pub fn merge_changes(target: &mut Record, changes: &Record) {
    for (field, value) in changes {
        if value.is_null() {
            target.remove(field);
        } else {
            target.insert(field.clone(), value.clone());
        }
    }
}

/// A message received from the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Opaque handle used to delete the message once processed
    pub receipt: String,
    /// Message body
    pub body: String,
    /// How many times this message has been handed out
    pub receive_count: u32,
}
