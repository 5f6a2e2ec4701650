use std::{cmp::Ordering, fmt::Display};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod query;
pub mod report;

/// A record is an open JSON object. Declared fields are validated against the
/// store's schema, anything else is carried through untouched.
pub type Record = serde_json::Map<String, Value>;

/// Primary key of a record. Integers order before strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Int(i64),
    Text(String),
}

impl Key {
    /// Reads a key out of a JSON value. Only integers (or floats without a
    /// fractional part) and strings are valid keys.
    pub fn from_value(value: &Value) -> Option<Key> {
        match value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    return Some(Key::Int(i));
                }
                match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Some(Key::Int(f as i64)),
                    _ => None,
                }
            }
            Value::String(s) => Some(Key::Text(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Key::Int(i) => Value::from(*i),
            Key::Text(s) => Value::String(s.clone()),
        }
    }

    pub fn as_index_value(&self) -> IndexValue {
        match self {
            Key::Int(i) => IndexValue::Number(*i as f64),
            Key::Text(s) => IndexValue::Text(s.clone()),
        }
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::Int(i) => write!(f, "{}", i),
            Key::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key::Int(value)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::Text(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::Text(value)
    }
}

/// Value held by a secondary index entry.
///
/// Only numbers and strings are indexable; numbers order before strings and
/// compare with `f64::total_cmp`, so the type is totally ordered and can key a
/// `BTreeMap`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndexValue {
    Number(f64),
    Text(String),
}

impl IndexValue {
    pub fn from_value(value: &Value) -> Option<IndexValue> {
        match value {
            Value::Number(n) => n.as_f64().map(IndexValue::Number),
            Value::String(s) => Some(IndexValue::Text(s.clone())),
            _ => None,
        }
    }
}

impl PartialEq for IndexValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexValue {}

impl PartialOrd for IndexValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (IndexValue::Number(a), IndexValue::Number(b)) => a.total_cmp(b),
            (IndexValue::Number(_), IndexValue::Text(_)) => Ordering::Less,
            (IndexValue::Text(_), IndexValue::Number(_)) => Ordering::Greater,
            (IndexValue::Text(a), IndexValue::Text(b)) => a.cmp(b),
        }
    }
}

impl Display for IndexValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexValue::Number(n) => write!(f, "{}", n),
            IndexValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for IndexValue {
    fn from(value: &str) -> Self {
        IndexValue::Text(value.to_string())
    }
}

impl From<String> for IndexValue {
    fn from(value: String) -> Self {
        IndexValue::Text(value)
    }
}

impl From<f64> for IndexValue {
    fn from(value: f64) -> Self {
        IndexValue::Number(value)
    }
}

impl From<i64> for IndexValue {
    fn from(value: i64) -> Self {
        IndexValue::Number(value as f64)
    }
}
