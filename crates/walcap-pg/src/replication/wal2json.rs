//! Decoder for wal2json format-version 2 payloads.
//!
//! Each XLogData payload carries one JSON object describing a single
//! action: B (begin), C (commit), I/U/D (row changes), T (truncate) or
//! M (logical decoding message).

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use walcap_core::{ChangeEvent, RowMap, TableRef, Value};

use super::lsn::Lsn;
use super::tuple::{TupleDecoder, TupleError};

/// Text wal2json substitutes for an unchanged TOAST value.
pub const UNCHANGED_TOAST: &str = "unchanged-toast-datum";

#[derive(Debug, Error)]
pub enum Wal2JsonError {
    #[error("malformed wal2json payload: {0}")]
    Malformed(String),

    #[error("column {column} of {relation}: {source}")]
    Row {
        relation: TableRef,
        column: String,
        #[source]
        source: TupleError,
    },
}

#[derive(Debug, Deserialize)]
struct Wal2JsonMessage {
    action: String,
    #[serde(default)]
    xid: Option<u32>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    lsn: Option<String>,
    #[serde(default)]
    nextlsn: Option<String>,
    #[serde(default)]
    schema: Option<String>,
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    columns: Option<Vec<Wal2JsonColumn>>,
    #[serde(default)]
    identity: Option<Vec<Wal2JsonColumn>>,
    #[serde(default)]
    prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Wal2JsonColumn {
    name: String,
    #[serde(default)]
    typeoid: Option<u32>,
    value: serde_json::Value,
}

/// Decode one wal2json payload.
///
/// Returns `Ok(None)` for actions that carry no change event (M).
pub fn decode_wal2json(
    payload: &[u8],
    decoder: &TupleDecoder,
) -> Result<Option<ChangeEvent>, Wal2JsonError> {
    let msg: Wal2JsonMessage = serde_json::from_slice(payload)
        .map_err(|e| Wal2JsonError::Malformed(e.to_string()))?;

    let event = match msg.action.as_str() {
        "B" => ChangeEvent::Begin {
            xid: msg.xid.unwrap_or_default(),
            final_lsn: parse_position(msg.lsn.as_deref())?,
            commit_time: parse_timestamp(msg.timestamp.as_deref()),
        },
        "C" => ChangeEvent::Commit {
            commit_lsn: parse_position(msg.lsn.as_deref())?,
            end_lsn: parse_position(msg.nextlsn.as_deref())?,
            commit_time: parse_timestamp(msg.timestamp.as_deref()),
        },
        "I" => {
            let relation = relation(&msg)?;
            let row = to_row(&relation, msg.columns.as_deref().unwrap_or_default(), decoder)?;
            ChangeEvent::Insert { relation, row }
        }
        "U" => {
            let relation = relation(&msg)?;
            let after = to_row(&relation, msg.columns.as_deref().unwrap_or_default(), decoder)?;
            let before = msg
                .identity
                .as_deref()
                .map(|cols| to_row(&relation, cols, decoder))
                .transpose()?;
            ChangeEvent::Update {
                relation,
                before,
                after,
            }
        }
        "D" => {
            let relation = relation(&msg)?;
            let before = to_row(&relation, msg.identity.as_deref().unwrap_or_default(), decoder)?;
            ChangeEvent::Delete { relation, before }
        }
        // wal2json does not report CASCADE / RESTART IDENTITY
        "T" => ChangeEvent::Truncate {
            relations: vec![relation(&msg)?],
            cascade: false,
            restart_identity: false,
        },
        "M" => {
            tracing::debug!(prefix = ?msg.prefix, "wal2json logical message");
            return Ok(None);
        }
        other => {
            return Err(Wal2JsonError::Malformed(format!("unknown action '{}'", other)));
        }
    };

    Ok(Some(event))
}

fn relation(msg: &Wal2JsonMessage) -> Result<TableRef, Wal2JsonError> {
    let table = msg
        .table
        .clone()
        .ok_or_else(|| Wal2JsonError::Malformed(format!("action {} without table", msg.action)))?;
    let schema = msg.schema.clone().unwrap_or_else(|| "public".to_string());
    Ok(TableRef::new(schema, table))
}

fn parse_position(lsn: Option<&str>) -> Result<u64, Wal2JsonError> {
    match lsn {
        Some(l) => l
            .parse::<Lsn>()
            .map(Lsn::as_u64)
            .map_err(|e| Wal2JsonError::Malformed(e.to_string())),
        None => Ok(0),
    }
}

fn parse_timestamp(ts: Option<&str>) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(ts?, "%Y-%m-%d %H:%M:%S%.f%#z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn to_row(
    relation: &TableRef,
    columns: &[Wal2JsonColumn],
    decoder: &TupleDecoder,
) -> Result<RowMap, Wal2JsonError> {
    columns
        .iter()
        .map(|col| {
            column_value(col, decoder)
                .map(|value| (col.name.clone(), value))
                .map_err(|source| Wal2JsonError::Row {
                    relation: relation.clone(),
                    column: col.name.clone(),
                    source,
                })
        })
        .collect()
}

// Strings go through the registered text decoder for their type, so
// timestamps, uuids and json columns come out typed. Everything else
// maps straight from JSON.
fn column_value(col: &Wal2JsonColumn, decoder: &TupleDecoder) -> Result<Value, TupleError> {
    match (&col.value, col.typeoid) {
        (serde_json::Value::String(s), _) if s == UNCHANGED_TOAST => Ok(Value::Unavailable),
        (serde_json::Value::String(s), Some(type_oid)) => {
            let text = super::pgoutput::ColumnValue::Text(s.as_bytes().to_vec());
            decoder.decode(&text, type_oid)
        }
        (value, _) => Ok(Value::from(value.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(data: &str) -> Result<Option<ChangeEvent>, Wal2JsonError> {
        decode_wal2json(data.as_bytes(), &TupleDecoder::new())
    }

    #[test]
    fn test_parse_insert() {
        let data = r#"{"action":"I","schema":"public","table":"users","columns":[{"name":"id","type":"integer","typeoid":23,"value":1},{"name":"name","type":"text","typeoid":25,"value":"Alice"}]}"#;

        match decode(data).unwrap().unwrap() {
            ChangeEvent::Insert { relation, row } => {
                assert_eq!(relation, TableRef::new("public", "users"));
                assert_eq!(row.get("id"), Some(&Value::Int(1)));
                assert_eq!(row.get("name"), Some(&Value::String("Alice".into())));
            }
            other => panic!("expected insert, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_update_with_and_without_identity() {
        let data = r#"{"action":"U","schema":"public","table":"users","columns":[{"name":"id","type":"integer","value":1},{"name":"name","type":"text","value":"Bob"}],"identity":[{"name":"id","type":"integer","value":1}]}"#;
        match decode(data).unwrap().unwrap() {
            ChangeEvent::Update { before, after, .. } => {
                assert_eq!(before.unwrap().get("id"), Some(&Value::Int(1)));
                assert_eq!(after.get("name"), Some(&Value::String("Bob".into())));
            }
            other => panic!("expected update, got {:?}", other),
        }

        let data = r#"{"action":"U","schema":"public","table":"users","columns":[{"name":"id","type":"integer","value":1}]}"#;
        match decode(data).unwrap().unwrap() {
            ChangeEvent::Update { before, .. } => assert!(before.is_none()),
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_delete_and_truncate() {
        let data = r#"{"action":"D","schema":"sales","table":"orders","identity":[{"name":"id","type":"integer","value":9}]}"#;
        match decode(data).unwrap().unwrap() {
            ChangeEvent::Delete { relation, before } => {
                assert_eq!(relation.to_string(), "sales.orders");
                assert_eq!(before.get("id"), Some(&Value::Int(9)));
            }
            other => panic!("expected delete, got {:?}", other),
        }

        let data = r#"{"action":"T","schema":"public","table":"users"}"#;
        match decode(data).unwrap().unwrap() {
            ChangeEvent::Truncate { relations, .. } => {
                assert_eq!(relations, vec![TableRef::new("public", "users")]);
            }
            other => panic!("expected truncate, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_begin_commit() {
        let begin = r#"{"action":"B","xid":731,"timestamp":"2024-03-01 12:00:00.5+00","lsn":"0/16B3748","nextlsn":"0/16B3780"}"#;
        match decode(begin).unwrap().unwrap() {
            ChangeEvent::Begin {
                xid,
                final_lsn,
                commit_time,
            } => {
                assert_eq!(xid, 731);
                assert_eq!(final_lsn, 0x16B3748);
                assert!(commit_time.is_some());
            }
            other => panic!("expected begin, got {:?}", other),
        }

        let commit = r#"{"action":"C","xid":731,"lsn":"0/16B3790","nextlsn":"0/16B37C0"}"#;
        match decode(commit).unwrap().unwrap() {
            ChangeEvent::Commit {
                commit_lsn,
                end_lsn,
                commit_time,
            } => {
                assert_eq!(commit_lsn, 0x16B3790);
                assert_eq!(end_lsn, 0x16B37C0);
                assert!(commit_time.is_none());
            }
            other => panic!("expected commit, got {:?}", other),
        }
    }

    #[test]
    fn test_typed_strings_and_unchanged_toast() {
        let data = r#"{"action":"I","schema":"public","table":"docs","columns":[{"name":"id","type":"uuid","typeoid":2950,"value":"a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11"},{"name":"body","type":"text","typeoid":25,"value":"unchanged-toast-datum"},{"name":"note","type":"text","typeoid":25,"value":null}]}"#;
        match decode(data).unwrap().unwrap() {
            ChangeEvent::Insert { row, .. } => {
                assert!(matches!(row.get("id"), Some(Value::Uuid(_))));
                assert_eq!(row.get("body"), Some(&Value::Unavailable));
                assert_eq!(row.get("note"), Some(&Value::Null));
            }
            other => panic!("expected insert, got {:?}", other),
        }
    }

    #[test]
    fn test_errors() {
        assert!(matches!(decode("not json"), Err(Wal2JsonError::Malformed(_))));
        assert!(matches!(
            decode(r#"{"action":"X"}"#),
            Err(Wal2JsonError::Malformed(_))
        ));
        assert!(matches!(
            decode(r#"{"action":"I","columns":[]}"#),
            Err(Wal2JsonError::Malformed(_))
        ));

        let bad_uuid = r#"{"action":"I","schema":"public","table":"docs","columns":[{"name":"id","type":"uuid","typeoid":2950,"value":"nope"}]}"#;
        assert!(matches!(
            decode(bad_uuid),
            Err(Wal2JsonError::Row { ref column, .. }) if column == "id"
        ));

        let message = r#"{"action":"M","transactional":false,"prefix":"app","content":"hi"}"#;
        assert!(decode(message).unwrap().is_none());
    }
}
