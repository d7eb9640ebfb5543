//! Legacy record keys.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{MigrateError, Result};

/// Primary key of a legacy record.
///
/// Keys order integers before text, then by value, which gives every entity a
/// deterministic ascending processing order for batching and resume.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordKey {
    Int(i64),
    Text(String),
}

impl RecordKey {
    /// Extract a key from a JSON field value.
    ///
    /// Integral numbers become `Int`, strings become `Text`. Anything else
    /// (null, floats, objects) is not a usable key.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(RecordKey::Int),
            Value::String(s) => Some(RecordKey::Text(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            RecordKey::Int(v) => Value::from(*v),
            RecordKey::Text(v) => Value::String(v.clone()),
        }
    }

    /// Storage encoding used by mapping and checkpoint rows.
    ///
    /// `Int(42)` encodes as `42` and `Text("42")` as `"42"`, so the two never
    /// collide.
    pub fn encode(&self) -> String {
        match self {
            RecordKey::Int(v) => v.to_string(),
            RecordKey::Text(v) => Value::String(v.clone()).to_string(),
        }
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(encoded)?;
        RecordKey::from_value(&value)
            .ok_or_else(|| MigrateError::State(format!("Invalid encoded record key: {}", encoded)))
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Int(v) => write!(f, "{}", v),
            RecordKey::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for RecordKey {
    fn from(value: i64) -> Self {
        RecordKey::Int(value)
    }
}

impl From<i32> for RecordKey {
    fn from(value: i32) -> Self {
        RecordKey::Int(i64::from(value))
    }
}

impl From<&str> for RecordKey {
    fn from(value: &str) -> Self {
        RecordKey::Text(value.to_string())
    }
}

impl From<String> for RecordKey {
    fn from(value: String) -> Self {
        RecordKey::Text(value)
    }
}

/// Serde adapter for maps keyed by [`RecordKey`].
///
/// JSON object keys are always strings, which would turn `Int` keys into
/// `Text` on the way back. Keys are written in their storage encoding instead.
pub mod encoded_map {
    use super::RecordKey;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<V, S>(map: &BTreeMap<RecordKey, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        V: Serialize,
        S: Serializer,
    {
        let encoded: BTreeMap<String, &V> = map.iter().map(|(k, v)| (k.encode(), v)).collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, V, D>(deserializer: D) -> Result<BTreeMap<RecordKey, V>, D::Error>
    where
        V: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        let encoded = BTreeMap::<String, V>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|(k, v)| {
                RecordKey::decode(&k)
                    .map(|key| (key, v))
                    .map_err(D::Error::custom)
            })
            .collect()
    }
}
