//! Row parser: one raw JSON record in, one typed row out. A malformed record
//! is a local failure; the task skips it and the partition keeps moving.

use chrono::DateTime;
use serde_json::Value;

use crate::config::{ColumnKind, ColumnSpec};
use crate::message::Row;

#[derive(thiserror::Error, Debug, PartialEq)]
#[error("{0}")]
pub(crate) struct ParseError(String);

pub(crate) fn parse_row(columns: &[ColumnSpec], payload: &[u8]) -> Result<Row, ParseError> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|err| ParseError(format!("Invalid JSON payload: {err}")))?;
    let Some(object) = value.as_object() else {
        return Err(ParseError("Payload is not a JSON object".to_string()));
    };

    let mut row = Row::new();
    for column in columns {
        let field = column.source_field();
        match object.get(field) {
            None | Some(Value::Null) => {
                if !column.nullable {
                    return Err(ParseError(format!("Missing field `{field}`")));
                }
                row.insert(column.name.clone(), Value::Null);
            }
            Some(value) => {
                row.insert(column.name.clone(), coerce(field, value, column.kind)?);
            }
        }
    }
    Ok(row)
}

/// Checks the JSON value against the column kind and normalizes it into the
/// representation the store accepts for that type.
fn coerce(field: &str, value: &Value, kind: ColumnKind) -> Result<Value, ParseError> {
    let mismatch = || ParseError(format!("Field `{field}` is not a valid {kind:?}"));
    match kind {
        ColumnKind::Int64 => value.as_i64().map(Value::from).ok_or_else(mismatch),
        ColumnKind::Uint64 => value.as_u64().map(Value::from).ok_or_else(mismatch),
        ColumnKind::Float64 => value.as_f64().map(Value::from).ok_or_else(mismatch),
        ColumnKind::String => value.as_str().map(Value::from).ok_or_else(mismatch),
        ColumnKind::Bool => value.as_bool().map(Value::from).ok_or_else(mismatch),
        // DateTime travels as epoch seconds; RFC 3339 strings are converted.
        ColumnKind::Datetime => match value {
            Value::Number(_) => value.as_i64().map(Value::from).ok_or_else(mismatch),
            Value::String(text) => DateTime::parse_from_rfc3339(text)
                .map(|ts| Value::from(ts.timestamp()))
                .map_err(|_| mismatch()),
            _ => Err(mismatch()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn columns() -> Vec<ColumnSpec> {
        serde_json::from_value(json!([
            { "name": "ts", "kind": "datetime" },
            { "name": "level", "source": "severity", "kind": "string" },
            { "name": "count", "kind": "uint64", "nullable": true },
            { "name": "ratio", "kind": "float64" },
            { "name": "ok", "kind": "bool" }
        ]))
        .unwrap()
    }

    #[test]
    fn parses_a_full_record() {
        let payload = br#"{"ts": 1700000000, "severity": "info", "count": 7, "ratio": 0.5, "ok": true}"#;
        let row = parse_row(&columns(), payload).unwrap();
        assert_eq!(row["ts"], json!(1700000000));
        assert_eq!(row["level"], json!("info"));
        assert_eq!(row["count"], json!(7));
        assert_eq!(row["ratio"], json!(0.5));
        assert_eq!(row["ok"], json!(true));
    }

    #[test]
    fn rfc3339_timestamps_become_epoch_seconds() {
        let payload =
            br#"{"ts": "2023-11-14T22:13:20Z", "severity": "warn", "ratio": 1.0, "ok": false}"#;
        let row = parse_row(&columns(), payload).unwrap();
        assert_eq!(row["ts"], json!(1700000000));
    }

    #[test]
    fn nullable_fields_may_be_absent() {
        let payload = br#"{"ts": 1, "severity": "info", "ratio": 2.0, "ok": true}"#;
        let row = parse_row(&columns(), payload).unwrap();
        assert_eq!(row["count"], serde_json::Value::Null);
    }

    #[test]
    fn missing_required_field_fails() {
        let payload = br#"{"ts": 1, "ratio": 2.0, "ok": true}"#;
        let err = parse_row(&columns(), payload).unwrap_err();
        assert!(err.to_string().contains("severity"));
    }

    #[test]
    fn type_mismatch_fails() {
        let payload = br#"{"ts": 1, "severity": "info", "ratio": "not-a-number", "ok": true}"#;
        assert!(parse_row(&columns(), payload).is_err());
    }

    #[test]
    fn negative_number_is_not_a_uint() {
        let columns: Vec<ColumnSpec> =
            serde_json::from_value(json!([{ "name": "n", "kind": "uint64" }])).unwrap();
        assert!(parse_row(&columns, br#"{"n": -1}"#).is_err());
    }

    #[test]
    fn garbage_payload_fails() {
        assert!(parse_row(&columns(), b"not json at all").is_err());
        assert!(parse_row(&columns(), br#"["an", "array"]"#).is_err());
    }
}
