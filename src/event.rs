//! Records, record identifiers, and the change events delivered by a live
//! subscription.
//!
//! This module provides the data types every other module depends on. No
//! I/O occurs here.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{RecordError, RemoteError};

/// Name of the field that uniquely identifies a record.
pub const ID_FIELD: &str = "id";

/// Unique identifier of a record within its table.
///
/// Backends hand out either integer keys or string keys (UUIDs, slugs), so
/// both are accepted. `Int(1)` and `Text("1")` are different ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Int(i64),
    Text(String),
}

impl RecordId {
    /// Interpret a JSON value as an id.
    ///
    /// Integers that do not fit in an `i64` (large unsigned keys) are kept
    /// in their decimal text form. Anything else (null, floats, booleans,
    /// arrays, objects) is not an id.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Self::Int(i)),
                None if n.is_u64() => Some(Self::Text(n.to_string())),
                None => None,
            },
            Value::String(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }

    /// Convert back into the JSON value stored in the `id` field.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Int(i) => Value::from(*i),
            Self::Text(s) => Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RecordId {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// An entity row: an opaque JSON object.
///
/// The engine only ever looks at the `id` field and the configured ordering
/// field; everything else is carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    /// Wrap an existing JSON object.
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// The record's id, if it carries a usable one.
    pub fn id(&self) -> Option<RecordId> {
        self.0.get(ID_FIELD).and_then(RecordId::from_value)
    }

    /// Look up a field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Set a field, returning the previous value.
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(field.into(), value.into())
    }

    /// Overlay every field of `patch` onto this record.
    pub fn merge(&mut self, patch: &Record) {
        for (k, v) in &patch.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// Borrow the underlying JSON object.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Consume the record into a JSON value.
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl TryFrom<Value> for Record {
    type Error = RecordError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Err(RecordError::NotAnObject("null")),
            Value::Bool(_) => Err(RecordError::NotAnObject("a boolean")),
            Value::Number(_) => Err(RecordError::NotAnObject("a number")),
            Value::String(_) => Err(RecordError::NotAnObject("a string")),
            Value::Array(_) => Err(RecordError::NotAnObject("an array")),
        }
    }
}

impl From<Map<String, Value>> for Record {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        record.into_value()
    }
}

/// A single row-level change delivered by a live subscription.
///
/// Serialized with an internal `type` tag, e.g.
/// `{"type":"update","record":{...},"previous":{...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChangeEvent {
    /// A row was created.
    Insert { record: Record },

    /// A row was modified. `previous` is only present when the backend is
    /// configured to ship old row images.
    Update {
        record: Record,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous: Option<Record>,
    },

    /// A row was removed. `previous` carries at least the `id`.
    Delete { previous: Record },
}

impl ChangeEvent {
    /// The kind of change, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Insert { .. } => "insert",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
        }
    }

    /// Id of the affected row.
    pub fn record_id(&self) -> Option<RecordId> {
        match self {
            Self::Insert { record } | Self::Update { record, .. } => record.id(),
            Self::Delete { previous } => previous.id(),
        }
    }
}

/// One item of a subscription stream.
///
/// The stream ending (yielding `None`) means the backend closed the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionMessage {
    /// Connection acknowledgement: the backend confirmed the subscription is
    /// live. Not a data event.
    Subscribed,
    /// A data event.
    Change(ChangeEvent),
    /// The transport reported an error; the subscription is no longer live.
    Failed(RemoteError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(value: Value) -> Record {
        Record::try_from(value).expect("test record should be an object")
    }

    #[test]
    fn record_id_from_integer_and_string() {
        assert_eq!(RecordId::from_value(&json!(5)), Some(RecordId::Int(5)));
        assert_eq!(
            RecordId::from_value(&json!("a1")),
            Some(RecordId::Text("a1".into()))
        );
        assert_eq!(
            RecordId::from_value(&json!(u64::MAX)),
            Some(RecordId::Text(u64::MAX.to_string()))
        );
    }

    #[test]
    fn record_id_rejects_non_keys() {
        assert_eq!(RecordId::from_value(&json!(null)), None);
        assert_eq!(RecordId::from_value(&json!(1.5)), None);
        assert_eq!(RecordId::from_value(&json!(true)), None);
        assert_eq!(RecordId::from_value(&json!({"id": 1})), None);
    }

    #[test]
    fn int_and_text_ids_are_distinct() {
        assert_ne!(RecordId::from(1), RecordId::from("1"));
    }

    #[test]
    fn record_exposes_id_and_fields() {
        let r = rec(json!({"id": 3, "status": "pending"}));
        assert_eq!(r.id(), Some(RecordId::Int(3)));
        assert_eq!(r.get("status"), Some(&json!("pending")));
        assert_eq!(r.get("missing"), None);
    }

    #[test]
    fn record_without_id_has_none() {
        assert_eq!(rec(json!({"status": "pending"})).id(), None);
    }

    #[test]
    fn non_object_is_rejected() {
        let err = Record::try_from(json!([1, 2])).expect_err("array is not a record");
        assert_eq!(err, RecordError::NotAnObject("an array"));
    }

    #[test]
    fn merge_overlays_fields() {
        let mut r = rec(json!({"id": 1, "status": "pending", "total": 10}));
        r.merge(&rec(json!({"status": "shipped"})));
        assert_eq!(r, rec(json!({"id": 1, "status": "shipped", "total": 10})));
    }

    #[test]
    fn change_event_wire_format() {
        let event = ChangeEvent::Update {
            record: rec(json!({"id": 1, "status": "shipped"})),
            previous: None,
        };
        let encoded = serde_json::to_value(&event).expect("serialize event");
        assert_eq!(
            encoded,
            json!({"type": "update", "record": {"id": 1, "status": "shipped"}})
        );

        let decoded: ChangeEvent = serde_json::from_value(json!({
            "type": "delete",
            "previous": {"id": "n-9"}
        }))
        .expect("deserialize event");
        assert_eq!(decoded.kind(), "delete");
        assert_eq!(decoded.record_id(), Some(RecordId::Text("n-9".into())));
    }
}
