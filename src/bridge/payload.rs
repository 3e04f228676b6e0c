// ABOUTME: Payload records accumulated by an operation and their typed property values
// ABOUTME: Best-effort coercion of raw property strings, plus typed field extraction for entities

use crate::error::Error;
use crate::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Target type hinted by the foreign side for a property value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    /// `true`/`false` and friends
    Bool,
    /// 64-bit float
    Float,
    /// Signed 64-bit integer
    Int,
    /// RFC 3339 timestamp or unix seconds
    Time,
    /// Stored verbatim
    String,
}

impl PropertyType {
    /// Map a hint string (`bool`, `float`, `int`, `time`) to a type; anything else is a string
    pub fn from_hint(hint: Option<&str>) -> Self {
        match hint {
            Some("bool") => PropertyType::Bool,
            Some("float") => PropertyType::Float,
            Some("int") => PropertyType::Int,
            Some("time") => PropertyType::Time,
            _ => PropertyType::String,
        }
    }
}

/// A typed property value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i64),
    /// Float
    Float(f64),
    /// Timestamp
    Time(DateTime<Utc>),
    /// String (also the fallback for failed coercions)
    String(String),
}

impl Value {
    /// Convert `raw` to `ty`, falling back to the raw string when it does not parse
    pub fn coerce(raw: &str, ty: PropertyType) -> Value {
        Self::parse(raw, ty).unwrap_or_else(|| Value::String(raw.to_string()))
    }

    fn parse(raw: &str, ty: PropertyType) -> Option<Value> {
        let trimmed = raw.trim();
        match ty {
            PropertyType::Bool => match trimmed.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Some(Value::Bool(true)),
                "false" | "no" | "off" | "0" => Some(Value::Bool(false)),
                _ => None,
            },
            PropertyType::Int => trimmed.parse().ok().map(Value::Int),
            PropertyType::Float => trimmed.parse().ok().map(Value::Float),
            PropertyType::Time => DateTime::parse_from_rfc3339(trimmed)
                .map(|t| t.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    trimmed
                        .parse::<i64>()
                        .ok()
                        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
                })
                .map(Value::Time),
            PropertyType::String => Some(Value::String(raw.to_string())),
        }
    }

    /// Name of the variant, used in shape errors
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Time(_) => "timestamp",
            Value::String(_) => "string",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Time(v) => write!(f, "{}", v.to_rfc3339()),
            Value::String(v) => f.write_str(v),
        }
    }
}

/// Conversion from a property value into a concrete field type
pub trait FromValue: Sized {
    /// Human-readable name of the expected type
    const EXPECTED: &'static str;

    /// Convert, or `None` on a type mismatch
    fn from_value(value: &Value) -> Option<Self>;
}

impl FromValue for String {
    const EXPECTED: &'static str = "string";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl FromValue for bool {
    const EXPECTED: &'static str = "bool";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl FromValue for i64 {
    const EXPECTED: &'static str = "integer";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl FromValue for u32 {
    const EXPECTED: &'static str = "unsigned 32-bit integer";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(i) => u32::try_from(*i).ok(),
            _ => None,
        }
    }
}

impl FromValue for u8 {
    const EXPECTED: &'static str = "unsigned 8-bit integer";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(i) => u8::try_from(*i).ok(),
            _ => None,
        }
    }
}

impl FromValue for f64 {
    const EXPECTED: &'static str = "float";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }
}

impl FromValue for DateTime<Utc> {
    const EXPECTED: &'static str = "timestamp";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Time(t) => Some(*t),
            _ => None,
        }
    }
}

/// One structured record returned within an operation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
    properties: HashMap<String, Value>,
    data: Vec<u8>,
}

impl Payload {
    /// Create an empty payload
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the payload carries neither properties nor raw data
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty() && self.data.is_empty()
    }

    /// Store a raw property, coercing it according to `hint`
    ///
    /// Empty keys and empty values are ignored.
    pub fn set_property(&mut self, key: &str, raw: &str, hint: Option<&str>) {
        if key.is_empty() || raw.is_empty() {
            return;
        }
        let value = Value::coerce(raw, PropertyType::from_hint(hint));
        self.properties.insert(key.to_string(), value);
    }

    /// Store an already typed value
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.properties.insert(key.into(), value);
    }

    /// Append raw bytes
    pub fn append_data(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    /// Look up a property
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// All properties
    pub fn properties(&self) -> &HashMap<String, Value> {
        &self.properties
    }

    /// Raw byte buffer
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Typed field lookup; a missing key yields the type's default
    ///
    /// A present value of the wrong type is a shape error.
    pub fn field<T: FromValue + Default>(&self, key: &str) -> Result<T> {
        Ok(self.optional_field(key)?.unwrap_or_default())
    }

    /// Typed field lookup distinguishing a missing key
    pub fn optional_field<T: FromValue>(&self, key: &str) -> Result<Option<T>> {
        match self.properties.get(key) {
            None => Ok(None),
            Some(value) => T::from_value(value).map(Some).ok_or_else(|| Error::Field {
                key: key.to_string(),
                reason: format!("expected {}, found {} {:?}", T::EXPECTED, value.type_name(), value.to_string()),
            }),
        }
    }

    /// Properties whose key starts with `prefix`, with the prefix stripped
    pub fn prefixed(&self, prefix: &str) -> Vec<(String, &Value)> {
        let mut entries: Vec<_> = self
            .properties
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(prefix).map(|rest| (rest.to_string(), v)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

/// Remove the trailing run of empty payloads
pub(crate) fn prune_trailing_empty(payloads: &mut Vec<Payload>) -> usize {
    let mut pruned = 0;
    while payloads.last().is_some_and(Payload::is_empty) {
        payloads.pop();
        pruned += 1;
    }
    pruned
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_property_is_coerced() {
        let mut payload = Payload::new();
        payload.set_property("count", "54", Some("int"));
        assert_eq!(payload.get("count"), Some(&Value::Int(54)));
        assert_eq!(payload.field::<u32>("count").unwrap(), 54);
    }

    #[test]
    fn test_malformed_property_degrades_to_string() {
        let mut payload = Payload::new();
        payload.set_property("rate", "fast", Some("int"));
        payload.set_property("flag", "maybe", Some("bool"));
        payload.set_property("gain", "1.5", Some("float"));
        payload.set_property("name", "sink0", None);

        assert_eq!(payload.get("rate"), Some(&Value::String("fast".into())));
        assert_eq!(payload.get("flag"), Some(&Value::String("maybe".into())));
        assert_eq!(payload.get("gain"), Some(&Value::Float(1.5)));
        assert_eq!(payload.get("name"), Some(&Value::String("sink0".into())));
    }

    #[test]
    fn test_time_coercion() {
        let rfc = Value::coerce("2024-05-01T12:00:00Z", PropertyType::Time);
        let unix = Value::coerce("1714564800", PropertyType::Time);
        assert_eq!(rfc, unix);
        assert_eq!(rfc.type_name(), "timestamp");
    }

    #[test]
    fn test_empty_key_or_value_is_ignored() {
        let mut payload = Payload::new();
        payload.set_property("", "1", Some("int"));
        payload.set_property("name", "", None);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_field_type_mismatch_is_shape_error() {
        let mut payload = Payload::new();
        payload.set_property("channels", "wrong-data-type", Some("int"));

        match payload.field::<u8>("channels") {
            Err(Error::Field { key, .. }) => assert_eq!(key, "channels"),
            other => panic!("expected field error, got {:?}", other),
        }
        // Missing keys fall back to defaults
        assert_eq!(payload.field::<String>("missing").unwrap(), "");
        assert_eq!(payload.optional_field::<bool>("missing").unwrap(), None);
    }

    #[test]
    fn test_prune_only_trailing_run() {
        let mut full = Payload::new();
        full.set_property("index", "0", Some("int"));
        let mut data_only = Payload::new();
        data_only.append_data(b"abc");

        let mut payloads = vec![
            full.clone(),
            Payload::new(),
            data_only.clone(),
            Payload::new(),
            Payload::new(),
        ];
        assert_eq!(prune_trailing_empty(&mut payloads), 2);
        assert_eq!(payloads, vec![full, Payload::new(), data_only]);

        let mut empty = vec![Payload::new()];
        prune_trailing_empty(&mut empty);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_prefixed_properties_sorted() {
        let mut payload = Payload::new();
        payload.set_property("prop.device.class", "sound", None);
        payload.set_property("prop.alsa.card", "0", None);
        payload.set_property("name", "x", None);

        let keys: Vec<_> = payload.prefixed("prop.").into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["alsa.card", "device.class"]);
    }
}
