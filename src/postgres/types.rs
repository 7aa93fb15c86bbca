//! Tuple-to-JSON conversion
//!
//! pgoutput sends column values in their text representation; this module
//! types them into JSON values using the column OID from the RELATION
//! message, so consumers see `{"id": 1, "active": true}` rather than
//! all-strings rows.
//!
//! Reference: <https://www.postgresql.org/docs/current/datatype.html>

use crate::postgres::protocol::{RelationBody, Tuple, TupleData};
use serde_json::Value;

/// Convert one column's text representation to a JSON value based on its
/// type OID. Values that fail to parse as their claimed type fall back to
/// the raw text rather than erroring: the source may hold values (NaN,
/// infinity) that JSON numbers cannot represent.
pub fn pg_text_to_json(type_oid: i32, text: &str) -> Value {
    match type_oid {
        // boolean
        16 => match text {
            "t" => Value::Bool(true),
            "f" => Value::Bool(false),
            other => Value::String(other.to_string()),
        },

        // smallint/int2, integer/int4, bigint/int8, oid
        21 | 23 | 20 | 26 => text
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(text.to_string())),

        // real/float4, double precision/float8
        700 | 701 => text
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(text.to_string())),

        // numeric/decimal stays a string to preserve precision
        1700 => Value::String(text.to_string()),

        // json, jsonb pass through parsed
        114 | 3802 => {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
        }

        // everything else (text, varchar, uuid, timestamps, bytea hex,
        // arrays, ...) keeps the server's text rendering
        _ => Value::String(text.to_string()),
    }
}

/// Convert a decoded tuple to a JSON object using the relation's column
/// definitions.
///
/// `previous` supplies values for TOAST columns the server did not resend
/// (unchanged large values on UPDATE); without a previous row those
/// columns are omitted.
pub fn tuple_to_json(tuple: &Tuple, relation: &RelationBody, previous: Option<&Value>) -> Value {
    let mut map = serde_json::Map::with_capacity(tuple.0.len());
    for (i, data) in tuple.0.iter().enumerate() {
        let Some(column) = relation.columns.get(i) else {
            continue;
        };
        match data {
            TupleData::Null => {
                map.insert(column.name.clone(), Value::Null);
            }
            TupleData::Toast => {
                if let Some(prev) = previous.and_then(|p| p.get(&column.name)) {
                    map.insert(column.name.clone(), prev.clone());
                }
            }
            TupleData::Text(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                map.insert(column.name.clone(), pg_text_to_json(column.type_id, &text));
            }
        }
    }
    Value::Object(map)
}

/// Compose the row identity from the relation's key columns: key values
/// joined with `.` in column order.
///
/// Returns `None` when a key column is missing or NULL - such a row
/// cannot be addressed and is a replica-identity misconfiguration.
pub fn row_identity(tuple: &Tuple, relation: &RelationBody) -> Option<String> {
    let mut parts = Vec::new();
    for (i, column) in relation.columns.iter().enumerate() {
        if !column.is_key() {
            continue;
        }
        match tuple.0.get(i)? {
            TupleData::Text(bytes) => parts.push(String::from_utf8_lossy(bytes).into_owned()),
            TupleData::Null | TupleData::Toast => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postgres::protocol::Column;
    use bytes::Bytes;
    use serde_json::json;

    fn relation(columns: Vec<(&str, i32, bool)>) -> RelationBody {
        RelationBody {
            id: 1,
            namespace: "public".into(),
            name: "users".into(),
            replica_identity: b'd',
            columns: columns
                .into_iter()
                .map(|(name, type_id, key)| Column {
                    flags: u8::from(key),
                    name: name.into(),
                    type_id,
                    type_mode: -1,
                })
                .collect(),
        }
    }

    fn text_tuple(values: Vec<Option<&str>>) -> Tuple {
        Tuple(
            values
                .into_iter()
                .map(|v| match v {
                    Some(s) => TupleData::Text(Bytes::copy_from_slice(s.as_bytes())),
                    None => TupleData::Null,
                })
                .collect(),
        )
    }

    #[test]
    fn test_scalar_typing() {
        assert_eq!(pg_text_to_json(16, "t"), json!(true));
        assert_eq!(pg_text_to_json(16, "f"), json!(false));
        assert_eq!(pg_text_to_json(23, "42"), json!(42));
        assert_eq!(pg_text_to_json(20, "-7"), json!(-7));
        assert_eq!(pg_text_to_json(701, "1.5"), json!(1.5));
        assert_eq!(pg_text_to_json(25, "hello"), json!("hello"));
        // numeric preserves precision as text
        assert_eq!(
            pg_text_to_json(1700, "123456789.000000001"),
            json!("123456789.000000001")
        );
        // jsonb parses
        assert_eq!(pg_text_to_json(3802, r#"{"a": 1}"#), json!({"a": 1}));
    }

    #[test]
    fn test_unparseable_values_fall_back_to_text() {
        assert_eq!(pg_text_to_json(23, "not-a-number"), json!("not-a-number"));
        assert_eq!(pg_text_to_json(701, "NaN"), json!("NaN"));
        assert_eq!(pg_text_to_json(3802, "{broken"), json!("{broken"));
    }

    #[test]
    fn test_tuple_to_json() {
        let rel = relation(vec![("id", 23, true), ("name", 25, false), ("age", 23, false)]);
        let tuple = text_tuple(vec![Some("1"), Some("Paul"), None]);

        let row = tuple_to_json(&tuple, &rel, None);
        assert_eq!(row, json!({"id": 1, "name": "Paul", "age": null}));
    }

    #[test]
    fn test_toast_backfilled_from_previous() {
        let rel = relation(vec![("id", 23, true), ("blob", 25, false)]);
        let tuple = Tuple(vec![
            TupleData::Text(Bytes::from_static(b"1")),
            TupleData::Toast,
        ]);

        let prev = json!({"id": 1, "blob": "big-unchanged-value"});
        let row = tuple_to_json(&tuple, &rel, Some(&prev));
        assert_eq!(row, json!({"id": 1, "blob": "big-unchanged-value"}));

        // Without a previous row the column is omitted
        let row = tuple_to_json(&tuple, &rel, None);
        assert_eq!(row, json!({"id": 1}));
    }

    #[test]
    fn test_row_identity_single_key() {
        let rel = relation(vec![("id", 23, true), ("name", 25, false)]);
        let tuple = text_tuple(vec![Some("42"), Some("Paul")]);
        assert_eq!(row_identity(&tuple, &rel).as_deref(), Some("42"));
    }

    #[test]
    fn test_row_identity_composite_key() {
        let rel = relation(vec![("order_id", 23, true), ("line", 23, true), ("qty", 23, false)]);
        let tuple = text_tuple(vec![Some("42"), Some("7"), Some("3")]);
        assert_eq!(row_identity(&tuple, &rel).as_deref(), Some("42.7"));
    }

    #[test]
    fn test_row_identity_missing_key_is_none() {
        let rel = relation(vec![("id", 23, true), ("name", 25, false)]);
        let tuple = text_tuple(vec![None, Some("Paul")]);
        assert_eq!(row_identity(&tuple, &rel), None);

        let rel = relation(vec![("id", 23, false)]);
        let tuple = text_tuple(vec![Some("1")]);
        assert_eq!(row_identity(&tuple, &rel), None);
    }
}
