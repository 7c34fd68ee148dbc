//! Session record shapes at each stage boundary

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A session document as read from the source collection.
///
/// Every field the transformer validates is optional here so that absence
/// survives extraction and is reported by the stage that owns the check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSessionDocument {
    /// Store-internal identifier, already rendered as a portable string
    #[serde(default)]
    pub document_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pages_visited: Option<Vec<String>>,
    #[serde(default, deserialize_with = "deserialize_scalar_string")]
    pub device: Option<String>,
    #[serde(default)]
    pub actions: Option<Vec<String>>,
}

/// The load-ready shape the warehouse contract depends on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalSessionRecord {
    pub session_id: String,
    pub user_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub pages_visited: Vec<String>,
    pub pages_visited_count: i64,
    pub device: String,
    pub actions: Vec<String>,
}

impl RawSessionDocument {
    /// Decode a stored document body. `_id` and unknown fields are ignored.
    pub fn from_body(document_id: String, body: &Value) -> Result<Self, serde_json::Error> {
        let mut doc: RawSessionDocument = serde_json::from_value(body.clone())?;
        doc.document_id = document_id;
        Ok(doc)
    }
}

/// Accepts RFC 3339 strings, epoch milliseconds, and extended JSON dates:
/// `{"$date": "..."}`, `{"$date": 1700000000000}`, `{"$date": {"$numberLong": "..."}}`.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => parse_timestamp(&v).map(Some).map_err(serde::de::Error::custom),
    }
}

pub(crate) fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, String> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| format!("invalid timestamp '{s}': {e}")),
        Value::Number(n) => {
            let millis = n
                .as_i64()
                .ok_or_else(|| format!("timestamp {n} is not an integer millisecond value"))?;
            Utc.timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| format!("timestamp {millis} is out of range"))
        }
        Value::Object(map) => match map.get("$date") {
            Some(Value::Object(inner)) => match inner.get("$numberLong") {
                Some(Value::String(s)) => {
                    let millis: i64 = s
                        .parse()
                        .map_err(|_| format!("invalid $numberLong '{s}'"))?;
                    parse_timestamp(&Value::from(millis))
                }
                _ => Err("unsupported $date representation".to_string()),
            },
            Some(inner) => parse_timestamp(inner),
            None => Err("timestamp object without $date".to_string()),
        },
        other => Err(format!("unsupported timestamp value {other}")),
    }
}

/// Stringifies any scalar; `null` counts as absent.
fn deserialize_scalar_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}
