//! Converts raw pgoutput column values into typed [`Value`]s.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use thiserror::Error;
use uuid::Uuid;
use walcap_core::Value;

use super::pgoutput::ColumnValue;

/// Decodes the text representation of one column type.
pub type TextDecodeFn = fn(&str) -> Result<Value, String>;

/// Per-column decode failures. These reject a row, never the session.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TupleError {
    #[error("column of type {type_oid} is not valid UTF-8")]
    InvalidUtf8 { type_oid: u32 },

    #[error("malformed value {value:?} for type {type_oid}: {reason}")]
    Malformed {
        type_oid: u32,
        value: String,
        reason: String,
    },

    #[error("binary encoded column of type {type_oid} is not supported")]
    BinaryUnsupported { type_oid: u32 },
}

// Built-in type OIDs (pg_type.h)
pub mod oid {
    pub const BOOL: u32 = 16;
    pub const BYTEA: u32 = 17;
    pub const NAME: u32 = 19;
    pub const INT8: u32 = 20;
    pub const INT2: u32 = 21;
    pub const INT4: u32 = 23;
    pub const TEXT: u32 = 25;
    pub const OID: u32 = 26;
    pub const JSON: u32 = 114;
    pub const FLOAT4: u32 = 700;
    pub const FLOAT8: u32 = 701;
    pub const BPCHAR: u32 = 1042;
    pub const VARCHAR: u32 = 1043;
    pub const DATE: u32 = 1082;
    pub const TIMESTAMP: u32 = 1114;
    pub const TIMESTAMPTZ: u32 = 1184;
    pub const NUMERIC: u32 = 1700;
    pub const UUID: u32 = 2950;
    pub const JSONB: u32 = 3802;
}

/// Registry of text decoders keyed by type OID.
///
/// Types without a registered decoder pass through as `Value::String`.
#[derive(Debug, Clone)]
pub struct TupleDecoder {
    decoders: HashMap<u32, TextDecodeFn>,
}

impl TupleDecoder {
    /// A decoder with the built-in types registered.
    pub fn new() -> Self {
        let mut decoder = Self::empty();
        decoder.register(oid::BOOL, decode_bool);
        for int_oid in [oid::INT2, oid::INT4, oid::INT8, oid::OID] {
            decoder.register(int_oid, decode_int);
        }
        decoder.register(oid::FLOAT4, decode_float);
        decoder.register(oid::FLOAT8, decode_float);
        decoder.register(oid::NUMERIC, decode_numeric);
        for text_oid in [oid::TEXT, oid::VARCHAR, oid::BPCHAR, oid::NAME] {
            decoder.register(text_oid, decode_text);
        }
        decoder.register(oid::JSON, decode_json);
        decoder.register(oid::JSONB, decode_json);
        decoder.register(oid::UUID, decode_uuid);
        decoder.register(oid::BYTEA, decode_bytea);
        decoder.register(oid::DATE, decode_date);
        decoder.register(oid::TIMESTAMP, decode_timestamp);
        decoder.register(oid::TIMESTAMPTZ, decode_timestamptz);
        decoder
    }

    /// A decoder that passes every type through as text.
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register (or replace) the decoder for a type OID.
    pub fn register(&mut self, type_oid: u32, decode: TextDecodeFn) {
        self.decoders.insert(type_oid, decode);
    }

    pub fn decode(&self, column: &ColumnValue, type_oid: u32) -> Result<Value, TupleError> {
        match column {
            ColumnValue::Null => Ok(Value::Null),
            ColumnValue::UnchangedToast => Ok(Value::Unavailable),
            ColumnValue::Binary(_) => Err(TupleError::BinaryUnsupported { type_oid }),
            ColumnValue::Text(bytes) => {
                let text =
                    std::str::from_utf8(bytes).map_err(|_| TupleError::InvalidUtf8 { type_oid })?;
                match self.decoders.get(&type_oid) {
                    Some(decode) => decode(text).map_err(|reason| TupleError::Malformed {
                        type_oid,
                        value: text.to_string(),
                        reason,
                    }),
                    None => Ok(Value::String(text.to_string())),
                }
            }
        }
    }
}

impl Default for TupleDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_bool(s: &str) -> Result<Value, String> {
    match s {
        "t" | "true" => Ok(Value::Bool(true)),
        "f" | "false" => Ok(Value::Bool(false)),
        _ => Err("expected 't' or 'f'".to_string()),
    }
}

fn decode_int(s: &str) -> Result<Value, String> {
    s.parse::<i64>().map(Value::Int).map_err(|e| e.to_string())
}

fn decode_float(s: &str) -> Result<Value, String> {
    s.parse::<f64>().map(Value::Float).map_err(|e| e.to_string())
}

fn decode_numeric(s: &str) -> Result<Value, String> {
    let special = matches!(s, "NaN" | "Infinity" | "-Infinity");
    let digits = s.trim_start_matches(['-', '+']);
    let plain = !digits.is_empty()
        && digits.chars().any(|c| c.is_ascii_digit())
        && digits
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '-' | '+'));

    if special || plain {
        Ok(Value::Numeric(s.to_string()))
    } else {
        Err("not a numeric literal".to_string())
    }
}

fn decode_text(s: &str) -> Result<Value, String> {
    Ok(Value::String(s.to_string()))
}

fn decode_json(s: &str) -> Result<Value, String> {
    serde_json::from_str::<serde_json::Value>(s)
        .map(Value::Json)
        .map_err(|e| e.to_string())
}

fn decode_uuid(s: &str) -> Result<Value, String> {
    Uuid::parse_str(s).map(Value::Uuid).map_err(|e| e.to_string())
}

fn decode_bytea(s: &str) -> Result<Value, String> {
    let hex_digits = s
        .strip_prefix("\\x")
        .ok_or_else(|| "expected hex format (\\x...)".to_string())?;
    hex::decode(hex_digits)
        .map(Value::Bytes)
        .map_err(|e| e.to_string())
}

// infinity, -infinity and BC dates have no chrono counterpart; keep the text
fn is_special_datetime(s: &str) -> bool {
    matches!(s, "infinity" | "-infinity") || s.ends_with(" BC")
}

fn decode_date(s: &str) -> Result<Value, String> {
    if is_special_datetime(s) {
        return Ok(Value::String(s.to_string()));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map(Value::Date)
        .map_err(|e| e.to_string())
}

fn decode_timestamp(s: &str) -> Result<Value, String> {
    if is_special_datetime(s) {
        return Ok(Value::String(s.to_string()));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .map(Value::Timestamp)
        .map_err(|e| e.to_string())
}

fn decode_timestamptz(s: &str) -> Result<Value, String> {
    if is_special_datetime(s) {
        return Ok(Value::String(s.to_string()));
    }
    DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z")
        .map(Value::TimestampTz)
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    fn text(s: &str) -> ColumnValue {
        ColumnValue::Text(s.as_bytes().to_vec())
    }

    #[test]
    fn test_null_and_unchanged_are_distinct() {
        let decoder = TupleDecoder::new();
        let null = decoder.decode(&ColumnValue::Null, oid::TEXT).unwrap();
        let unavailable = decoder
            .decode(&ColumnValue::UnchangedToast, oid::TEXT)
            .unwrap();

        assert_eq!(null, Value::Null);
        assert_eq!(unavailable, Value::Unavailable);
        assert_ne!(null, unavailable);
    }

    #[test]
    fn test_builtin_scalars() {
        let decoder = TupleDecoder::new();
        assert_eq!(decoder.decode(&text("7"), oid::INT4).unwrap(), Value::Int(7));
        assert_eq!(
            decoder.decode(&text("-9000000000"), oid::INT8).unwrap(),
            Value::Int(-9_000_000_000)
        );
        assert_eq!(decoder.decode(&text("t"), oid::BOOL).unwrap(), Value::Bool(true));
        assert_eq!(decoder.decode(&text("f"), oid::BOOL).unwrap(), Value::Bool(false));
        assert_eq!(
            decoder.decode(&text("1.5"), oid::FLOAT8).unwrap(),
            Value::Float(1.5)
        );
        assert_eq!(
            decoder.decode(&text("12345678901234567890.123"), oid::NUMERIC).unwrap(),
            Value::Numeric("12345678901234567890.123".to_string())
        );
        assert_eq!(
            decoder.decode(&text("alice"), oid::TEXT).unwrap(),
            Value::String("alice".to_string())
        );
    }

    #[test]
    fn test_json_uuid_bytea() {
        let decoder = TupleDecoder::new();
        assert_eq!(
            decoder.decode(&text(r#"{"a":1}"#), oid::JSONB).unwrap(),
            Value::Json(serde_json::json!({"a": 1}))
        );

        let id = "a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11";
        assert_eq!(
            decoder.decode(&text(id), oid::UUID).unwrap(),
            Value::Uuid(Uuid::parse_str(id).unwrap())
        );

        assert_eq!(
            decoder.decode(&text("\\xdeadbeef"), oid::BYTEA).unwrap(),
            Value::Bytes(vec![0xde, 0xad, 0xbe, 0xef])
        );
    }

    #[test]
    fn test_dates_and_timestamps() {
        let decoder = TupleDecoder::new();

        match decoder.decode(&text("2024-03-01"), oid::DATE).unwrap() {
            Value::Date(d) => assert_eq!((d.year(), d.month(), d.day()), (2024, 3, 1)),
            other => panic!("expected date, got {:?}", other),
        }

        match decoder
            .decode(&text("2024-03-01 12:34:56.789"), oid::TIMESTAMP)
            .unwrap()
        {
            Value::Timestamp(ts) => assert_eq!(ts.second(), 56),
            other => panic!("expected timestamp, got {:?}", other),
        }

        match decoder
            .decode(&text("2024-03-01 12:34:56+02"), oid::TIMESTAMPTZ)
            .unwrap()
        {
            Value::TimestampTz(ts) => assert_eq!(ts.offset().local_minus_utc(), 7200),
            other => panic!("expected timestamptz, got {:?}", other),
        }

        assert_eq!(
            decoder.decode(&text("infinity"), oid::TIMESTAMPTZ).unwrap(),
            Value::String("infinity".to_string())
        );
    }

    #[test]
    fn test_unknown_type_passes_through() {
        let decoder = TupleDecoder::new();
        // inet has no registered decoder
        assert_eq!(
            decoder.decode(&text("10.0.0.1/32"), 869).unwrap(),
            Value::String("10.0.0.1/32".to_string())
        );
    }

    #[test]
    fn test_malformed_value_is_typed_error() {
        let decoder = TupleDecoder::new();
        let err = decoder.decode(&text("seven"), oid::INT4).unwrap_err();
        assert!(matches!(
            err,
            TupleError::Malformed { type_oid: oid::INT4, ref value, .. } if value == "seven"
        ));

        assert!(decoder.decode(&text("maybe"), oid::BOOL).is_err());
        assert!(decoder.decode(&text("{oops"), oid::JSON).is_err());
        assert!(decoder.decode(&text("abc"), oid::NUMERIC).is_err());
    }

    #[test]
    fn test_binary_and_invalid_utf8() {
        let decoder = TupleDecoder::new();
        assert_eq!(
            decoder.decode(&ColumnValue::Binary(vec![0, 0, 0, 7]), oid::INT4),
            Err(TupleError::BinaryUnsupported { type_oid: oid::INT4 })
        );
        assert_eq!(
            decoder.decode(&ColumnValue::Text(vec![0xff, 0xfe]), oid::TEXT),
            Err(TupleError::InvalidUtf8 { type_oid: oid::TEXT })
        );
    }

    #[test]
    fn test_register_custom_decoder() {
        fn decode_point(s: &str) -> Result<Value, String> {
            let inner = s.trim_start_matches('(').trim_end_matches(')');
            let coords: Vec<Value> = inner
                .split(',')
                .map(|c| c.parse::<f64>().map(Value::Float).map_err(|e| e.to_string()))
                .collect::<Result<_, _>>()?;
            Ok(Value::Array(coords))
        }

        let mut decoder = TupleDecoder::new();
        decoder.register(600, decode_point);
        assert_eq!(
            decoder.decode(&text("(1.5,2)"), 600).unwrap(),
            Value::Array(vec![Value::Float(1.5), Value::Float(2.0)])
        );
    }
}
