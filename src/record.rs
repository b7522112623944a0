//! Structured records exchanged between the host and plugin code.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

/// A dynamically typed record value.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(untagged))]
pub enum Value {
    /// Absent value.
    Nil,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Unsigned integer above `i64::MAX`.
    UInt(u64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Ordered list of values.
    Array(Vec<Value>),
    /// Nested mapping.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Get the string content, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get the value as a signed integer, if it fits.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::UInt(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    /// Get the value as a float.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            Self::UInt(u) => Some(*u as f64),
            _ => None,
        }
    }

    /// Get the boolean content, if this is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get the nested map, if this is a map.
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Check for nil.
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<u64> for Value {
    fn from(u: u64) -> Self {
        match i64::try_from(u) {
            Ok(i) => Self::Int(i),
            Err(_) => Self::UInt(u),
        }
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(m: BTreeMap<String, Value>) -> Self {
        Self::Map(m)
    }
}

/// Formats like Go's `%v`: maps print as `map[k:v ...]` with sorted keys.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => write!(f, "<nil>"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::UInt(u) => write!(f, "{}", u),
            Self::Float(x) => write!(f, "{}", x),
            Self::String(s) => write!(f, "{}", s),
            Self::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
            Self::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Self::Map(map) => fmt_map(f, map),
        }
    }
}

fn fmt_map(f: &mut fmt::Formatter<'_>, map: &BTreeMap<String, Value>) -> fmt::Result {
    write!(f, "map[")?;
    for (i, (k, v)) in map.iter().enumerate() {
        if i > 0 {
            write!(f, " ")?;
        }
        write!(f, "{}:{}", k, v)?;
    }
    write!(f, "]")
}

/// One tagged, timestamped event.
///
/// Records have no mutating accessors. Once handed to a channel they are
/// owned by whichever consumer receives them.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Record {
    tag: Arc<str>,
    time: DateTime<Utc>,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "BTreeMap::is_empty"))]
    metadata: BTreeMap<String, Value>,
    fields: BTreeMap<String, Value>,
}

impl Record {
    /// Create a record.
    pub fn new(
        tag: impl Into<Arc<str>>,
        time: DateTime<Utc>,
        fields: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            tag: tag.into(),
            time,
            metadata: BTreeMap::new(),
            fields,
        }
    }

    /// Create an empty record stamped with the current time.
    pub fn now(tag: impl Into<Arc<str>>) -> Self {
        Self::new(tag, Utc::now(), BTreeMap::new())
    }

    /// Add a field, consuming the record.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Replace the metadata map, consuming the record.
    pub fn with_metadata(mut self, metadata: BTreeMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Route tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Event time.
    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    /// Record fields.
    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Look up a single field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Per-record metadata; empty for legacy entries.
    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    /// Take the fields out of the record.
    pub fn into_fields(self) -> BTreeMap<String, Value> {
        self.fields
    }

    /// Render the fields as `map[k:v ...]`.
    pub fn fields_display(&self) -> FieldsDisplay<'_> {
        FieldsDisplay(&self.fields)
    }

    /// Serialize the record as JSON.
    #[cfg(feature = "serde")]
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| crate::Error::Encode(e.to_string()))
    }
}

/// Display adapter returned by [`Record::fields_display`].
#[derive(Debug)]
pub struct FieldsDisplay<'a>(&'a BTreeMap<String, Value>);

impl fmt::Display for FieldsDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_map(f, self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_record_builder() {
        let time = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let record = Record::new("app.log", time, BTreeMap::new())
            .with_field("message", "hello")
            .with_field("count", 3i64);

        assert_eq!(record.tag(), "app.log");
        assert_eq!(record.time(), time);
        assert_eq!(record.get("message").and_then(Value::as_str), Some("hello"));
        assert_eq!(record.get("count").and_then(Value::as_i64), Some(3));
        assert!(record.metadata().is_empty());
    }

    #[test]
    fn test_fields_display_sorted() {
        let record = Record::now("test-input")
            .with_field("message", "hello from go-test-input-plugin")
            .with_field("foo", "bar");

        assert_eq!(
            record.fields_display().to_string(),
            "map[foo:bar message:hello from go-test-input-plugin]"
        );
    }

    #[test]
    fn test_value_display_nested() {
        let mut inner = BTreeMap::new();
        inner.insert("b".to_string(), Value::Bool(true));
        inner.insert("a".to_string(), Value::Array(vec![Value::Int(1), Value::Nil]));

        assert_eq!(Value::Map(inner).to_string(), "map[a:[1 <nil>] b:true]");
        assert_eq!(Value::Bytes(b"raw".to_vec()).to_string(), "raw");
    }

    #[test]
    fn test_value_from_u64() {
        assert_eq!(Value::from(7u64), Value::Int(7));
        assert_eq!(Value::from(u64::MAX), Value::UInt(u64::MAX));
        assert_eq!(Value::UInt(u64::MAX).as_i64(), None);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_record_to_json() {
        let time = Utc.timestamp_opt(0, 0).unwrap();
        let record = Record::new("t", time, BTreeMap::new()).with_field("k", "v");
        let json: serde_json::Value = serde_json::from_str(&record.to_json().unwrap()).unwrap();

        assert_eq!(json["tag"], "t");
        assert_eq!(json["fields"]["k"], "v");
        assert!(json.get("metadata").is_none());
    }
}
