//! Tagged scalar carried by device fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single field value as it travels on the wire.
///
/// Deserialization tries the variants in declaration order, so JSON `1` is
/// `Int(1)` and JSON `1.0` is `Float(1.0)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    /// Decode a JSON scalar. Arrays, objects and `null` have no field value.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float)),
            Value::String(s) => Some(Self::Text(s.clone())),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Text(s) => Value::String(s.clone()),
        }
    }

    /// Numeric view of the value. Booleans and text are not numbers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Bool(_) | Self::Text(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, Self::Bool(_))
    }

    /// Equality where `Int(1)` matches `Float(1.0)` but never `Bool(true)`.
    pub fn loosely_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Text(a), Self::Text(b)) => a == b,
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_untagged_decode_order() {
        let v: FieldValue = serde_json::from_value(json!(1)).unwrap();
        assert_eq!(v, FieldValue::Int(1));
        let v: FieldValue = serde_json::from_value(json!(1.5)).unwrap();
        assert_eq!(v, FieldValue::Float(1.5));
        let v: FieldValue = serde_json::from_value(json!(true)).unwrap();
        assert_eq!(v, FieldValue::Bool(true));
        assert!(serde_json::from_value::<FieldValue>(json!([1])).is_err());
    }

    #[test]
    fn test_loose_equality() {
        assert!(FieldValue::Int(1).loosely_eq(&FieldValue::Float(1.0)));
        assert!(!FieldValue::Int(1).loosely_eq(&FieldValue::Bool(true)));
        assert!(!FieldValue::Bool(false).loosely_eq(&FieldValue::Int(0)));
        assert!(FieldValue::from("a").loosely_eq(&FieldValue::from("a")));
    }

    #[test]
    fn test_json_conversion() {
        assert_eq!(FieldValue::from_json(&json!(null)), None);
        assert_eq!(FieldValue::Float(f64::NAN).to_json(), Value::Null);
        assert_eq!(FieldValue::Int(127).to_json(), json!(127));
    }
}
