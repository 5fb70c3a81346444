use crate::error::decode::DecodeError;
use crate::event::kind::Action;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;

/// A single row-level change decoded from the replication stream.
///
/// `columns` maps column names to their textual values at the time of the
/// change; NULL columns are absent from the map rather than mapped to an
/// empty string. Records are created once at decode time and never
/// mutated afterwards.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DatabaseChange {
    pub action: Action,
    pub schema: String,
    pub table: String,
    pub columns: HashMap<String, String>,
    /// Commit timestamp reported by wal2json when include-timestamp is
    /// requested. None when the field is missing or unparseable.
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RawChange {
    action: String,
    schema: String,
    table: String,
    #[serde(default)]
    columns: Vec<RawColumn>,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawColumn {
    name: String,
    #[serde(default)]
    value: Value,
}

impl DatabaseChange {
    /// Decode a wal2json format-version-2 payload.
    ///
    /// Pure and side-effect free, so it is safe to call from any number of
    /// tasks at once. Unknown top-level fields are ignored; an action code
    /// outside I/U/D/T, malformed JSON, or an empty schema or table
    /// identifier is a decode failure.
    pub fn decode(payload: &[u8]) -> Result<DatabaseChange, DecodeError> {
        let raw: RawChange = serde_json::from_slice(payload)?;

        let action = Action::from_str(&raw.action)
            .map_err(|_| DecodeError::UnknownAction(raw.action.clone()))?;
        if raw.schema.is_empty() {
            return Err(DecodeError::EmptyIdentifier("schema"));
        }
        if raw.table.is_empty() {
            return Err(DecodeError::EmptyIdentifier("table"));
        }

        let mut columns = HashMap::with_capacity(raw.columns.len());
        for column in raw.columns {
            match column.value {
                // NULL is represented by key absence. A name listed twice
                // still follows last-write-wins, so a later NULL clears an
                // earlier value.
                Value::Null => {
                    columns.remove(&column.name);
                }
                Value::String(text) => {
                    columns.insert(column.name, text);
                }
                other => {
                    columns.insert(column.name, other.to_string());
                }
            }
        }

        let timestamp = raw.timestamp.as_deref().and_then(parse_wal2json_timestamp);

        Ok(DatabaseChange {
            action,
            schema: raw.schema,
            table: raw.table,
            columns,
            timestamp,
        })
    }
}

// wal2json renders timestamps like "2023-04-05 12:34:56.789012+00".
fn parse_wal2json_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z")
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    #[test]
    fn test_decode_insert() {
        let payload = br#"{
            "action": "I",
            "schema": "public",
            "table": "orders",
            "columns": [
                {"name": "id", "type": "uuid", "value": "8a7e"},
                {"name": "n", "type": "integer", "value": 1},
                {"name": "flag", "type": "boolean", "value": false}
            ]
        }"#;

        let change = DatabaseChange::decode(payload).unwrap();
        assert_eq!(change.action, Action::Insert);
        assert_eq!(change.schema, "public");
        assert_eq!(change.table, "orders");
        assert_eq!(change.columns.len(), 3);
        assert_eq!(change.columns["id"], "8a7e");
        assert_eq!(change.columns["n"], "1");
        assert_eq!(change.columns["flag"], "false");
    }

    #[test]
    fn test_decode_update_delete_truncate() {
        for (code, action) in [
            ("U", Action::Update),
            ("D", Action::Delete),
            ("T", Action::Truncate),
        ] {
            let payload = format!(
                r#"{{"action": "{}", "schema": "public", "table": "orders", "columns": []}}"#,
                code
            );
            let change = DatabaseChange::decode(payload.as_bytes()).unwrap();
            assert_eq!(change.action, action);
            assert!(change.columns.is_empty());
        }
    }

    #[test]
    fn test_decode_missing_columns_field() {
        let payload = br#"{"action": "T", "schema": "public", "table": "orders"}"#;
        let change = DatabaseChange::decode(payload).unwrap();
        assert_eq!(change.action, Action::Truncate);
        assert!(change.columns.is_empty());
    }

    #[test]
    fn test_decode_unknown_action_fails() {
        let payload = br#"{"action": "B", "schema": "public", "table": "orders", "columns": []}"#;
        let err = DatabaseChange::decode(payload).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownAction(code) if code == "B"));
    }

    #[test]
    fn test_decode_malformed_payload_fails() {
        assert!(DatabaseChange::decode(b"not json").is_err());
        assert!(DatabaseChange::decode(b"{\"action\": \"I\"}").is_err());
        assert!(DatabaseChange::decode(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_decode_empty_identifiers_fail() {
        let payload = br#"{"action": "I", "schema": "", "table": "orders", "columns": []}"#;
        let err = DatabaseChange::decode(payload).unwrap_err();
        assert!(matches!(err, DecodeError::EmptyIdentifier("schema")));

        let payload = br#"{"action": "I", "schema": "public", "table": "", "columns": []}"#;
        let err = DatabaseChange::decode(payload).unwrap_err();
        assert!(matches!(err, DecodeError::EmptyIdentifier("table")));
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let payload = br#"{
            "action": "D",
            "schema": "public",
            "table": "orders",
            "columns": [{"name": "id", "value": "1"}],
            "identity": [{"name": "id", "value": "1"}],
            "pk": [{"name": "id", "type": "integer"}]
        }"#;

        let change = DatabaseChange::decode(payload).unwrap();
        assert_eq!(change.action, Action::Delete);
        assert_eq!(change.columns["id"], "1");
    }

    #[test]
    fn test_decode_null_column_is_absent() {
        let payload = br#"{
            "action": "U",
            "schema": "public",
            "table": "orders",
            "columns": [
                {"name": "id", "value": "1"},
                {"name": "char_field", "value": null}
            ]
        }"#;

        let change = DatabaseChange::decode(payload).unwrap();
        assert_eq!(change.columns.get("id").map(String::as_str), Some("1"));
        assert_eq!(change.columns.get("char_field"), None);
    }

    #[test]
    fn test_decode_duplicate_column_last_write_wins() {
        let payload = br#"{
            "action": "I",
            "schema": "public",
            "table": "orders",
            "columns": [
                {"name": "id", "value": "old"},
                {"name": "id", "value": "new"}
            ]
        }"#;
        let change = DatabaseChange::decode(payload).unwrap();
        assert_eq!(change.columns["id"], "new");

        let payload = br#"{
            "action": "I",
            "schema": "public",
            "table": "orders",
            "columns": [
                {"name": "id", "value": "old"},
                {"name": "id", "value": null}
            ]
        }"#;
        let change = DatabaseChange::decode(payload).unwrap();
        assert_eq!(change.columns.get("id"), None);
    }

    #[test]
    fn test_decode_timestamp() {
        let payload = br#"{
            "action": "I",
            "schema": "public",
            "table": "orders",
            "timestamp": "2023-04-05 12:34:56.789012+00",
            "columns": [{"name": "id", "value": "1"}]
        }"#;

        let change = DatabaseChange::decode(payload).unwrap();
        let expected = Utc.from_utc_datetime(
            &NaiveDate::from_ymd_opt(2023, 4, 5)
                .unwrap()
                .and_hms_micro_opt(12, 34, 56, 789012)
                .unwrap(),
        );
        assert_eq!(change.timestamp, Some(expected));
    }

    #[test]
    fn test_decode_timestamp_missing_or_malformed_is_none() {
        let payload = br#"{"action": "I", "schema": "s", "table": "t", "columns": []}"#;
        assert_eq!(DatabaseChange::decode(payload).unwrap().timestamp, None);

        let payload =
            br#"{"action": "I", "schema": "s", "table": "t", "timestamp": "tuesday", "columns": []}"#;
        assert_eq!(DatabaseChange::decode(payload).unwrap().timestamp, None);
    }
}
