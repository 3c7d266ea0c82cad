use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use uuid::Uuid;

/// A decoded column value.
///
/// `Unavailable` is what an unchanged TOAST column decodes to: the value
/// exists in the table but was not sent in this record. It is never the
/// same thing as `Null`.
///
/// The JSON form is lossy in two places. `Unavailable` serializes as
/// `{"unchanged_toast": true}`, which a json/jsonb column can also hold,
/// and non-finite floats serialize as the strings Postgres prints
/// (`"NaN"`, `"Infinity"`, `"-Infinity"`). Consumers that need to tell
/// these apart should match on `Value` rather than its serialized form.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Unavailable,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Arbitrary precision numeric, kept in its text form.
    Numeric(String),
    String(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    Uuid(Uuid),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<FixedOffset>),
    Array(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Value::Unavailable)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Numeric(s) => Some(s),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(f) = n.as_f64() {
                    Value::Float(f)
                } else {
                    Value::Numeric(n.to_string())
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(arr) => {
                Value::Array(arr.into_iter().map(Value::from).collect())
            }
            obj @ serde_json::Value::Object(_) => Value::Json(obj),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Unavailable => {
                // Must not collapse into `null` downstream.
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("unchanged_toast", &true)?;
                map.end()
            }
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) if f.is_nan() => serializer.serialize_str("NaN"),
            Value::Float(f) if f.is_infinite() => {
                serializer.serialize_str(if *f > 0.0 { "Infinity" } else { "-Infinity" })
            }
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Numeric(s) | Value::String(s) => serializer.serialize_str(s),
            Value::Bytes(b) => serializer.serialize_str(&format!("\\x{}", hex::encode(b))),
            Value::Json(v) => v.serialize(serializer),
            Value::Uuid(u) => serializer.collect_str(u),
            Value::Date(d) => serializer.collect_str(d),
            Value::Timestamp(ts) => serializer.collect_str(&ts.format("%Y-%m-%dT%H:%M:%S%.f")),
            Value::TimestampTz(ts) => serializer.serialize_str(&ts.to_rfc3339()),
            Value::Array(items) => items.serialize(serializer),
        }
    }
}

/// Column name to decoded value.
pub type RowMap = BTreeMap<String, Value>;

/// A schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

impl Serialize for TableRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Column metadata carried by a schema change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnMeta {
    pub name: String,
    pub type_oid: u32,
    pub is_key: bool,
}

/// A change derived from the replication stream, in log order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeEvent {
    Begin {
        xid: u32,
        final_lsn: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        commit_time: Option<DateTime<Utc>>,
    },
    Commit {
        commit_lsn: u64,
        end_lsn: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        commit_time: Option<DateTime<Utc>>,
    },
    Insert {
        relation: TableRef,
        row: RowMap,
    },
    Update {
        relation: TableRef,
        /// Absent when the table's replica identity sends no old tuple.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before: Option<RowMap>,
        after: RowMap,
    },
    Delete {
        relation: TableRef,
        before: RowMap,
    },
    Truncate {
        relations: Vec<TableRef>,
        cascade: bool,
        restart_identity: bool,
    },
    SchemaChange {
        relation_id: u32,
        relation: TableRef,
        columns: Vec<ColumnMeta>,
    },
}

impl ChangeEvent {
    /// Short name of the event kind, for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::Begin { .. } => "begin",
            ChangeEvent::Commit { .. } => "commit",
            ChangeEvent::Insert { .. } => "insert",
            ChangeEvent::Update { .. } => "update",
            ChangeEvent::Delete { .. } => "delete",
            ChangeEvent::Truncate { .. } => "truncate",
            ChangeEvent::SchemaChange { .. } => "schema_change",
        }
    }

    /// The table a row-level event refers to.
    pub fn relation(&self) -> Option<&TableRef> {
        match self {
            ChangeEvent::Insert { relation, .. }
            | ChangeEvent::Update { relation, .. }
            | ChangeEvent::Delete { relation, .. }
            | ChangeEvent::SchemaChange { relation, .. } => Some(relation),
            _ => None,
        }
    }
}

/// An event together with the log position of the record that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeRecord {
    pub lsn: u64,
    #[serde(flatten)]
    pub event: ChangeEvent,
}

impl ChangeRecord {
    pub fn new(lsn: u64, event: ChangeEvent) -> Self {
        Self { lsn, event }
    }
}
