//! Host-side dynamic values.
//!
//! [`DynamicValue`] is the closed set of shapes that may cross the sandbox
//! boundary in either direction. Every marshalling site matches on it
//! exhaustively.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Largest integer a 64-bit float represents exactly (2^53 - 1).
pub const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// A dynamically typed value exchanged with sandboxed code.
///
/// Numbers are 64-bit floats, matching the sandbox numeric model. Object
/// entries keep insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum DynamicValue {
    /// `null` (also what `undefined` becomes on the way out).
    Null,
    /// A boolean.
    Bool(bool),
    /// A number. Integers beyond [`MAX_SAFE_INTEGER`] may lose precision.
    Number(f64),
    /// A UTF-8 string.
    String(String),
    /// An ordered list of values.
    Array(Vec<DynamicValue>),
    /// A string-keyed mapping in insertion order.
    Object(IndexMap<String, DynamicValue>),
}

impl DynamicValue {
    /// Short type label used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
        }
    }

    /// Nesting depth: scalars are 0, `[]` and `{}` are 1.
    pub fn depth(&self) -> usize {
        match self {
            Self::Null | Self::Bool(_) | Self::Number(_) | Self::String(_) => 0,
            Self::Array(items) => 1 + items.iter().map(Self::depth).max().unwrap_or(0),
            Self::Object(map) => 1 + map.values().map(Self::depth).max().unwrap_or(0),
        }
    }

    /// Returns the number if this is a [`DynamicValue::Number`].
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the string slice if this is a [`DynamicValue::String`].
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns `true` for [`DynamicValue::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<serde_json::Value> for DynamicValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            // u64/i64 outside the safe range round to the nearest f64
            serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Self::from).collect())
            }
            serde_json::Value::Object(map) => {
                Self::Object(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl From<DynamicValue> for serde_json::Value {
    fn from(value: DynamicValue) -> Self {
        match value {
            DynamicValue::Null => serde_json::Value::Null,
            DynamicValue::Bool(b) => serde_json::Value::Bool(b),
            DynamicValue::Number(n) => number_to_json(n),
            DynamicValue::String(s) => serde_json::Value::String(s),
            DynamicValue::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            DynamicValue::Object(map) => serde_json::Value::Object(
                map.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
        }
    }
}

/// Integral values in the safe range become JSON integers; NaN and
/// infinities have no JSON form and become `null`.
fn number_to_json(n: f64) -> serde_json::Value {
    if !n.is_finite() {
        return serde_json::Value::Null;
    }
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        return serde_json::Value::from(n as i64);
    }
    serde_json::Number::from_f64(n)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null)
}

impl From<bool> for DynamicValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for DynamicValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i64> for DynamicValue {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<&str> for DynamicValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for DynamicValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Vec<DynamicValue>> for DynamicValue {
    fn from(items: Vec<DynamicValue>) -> Self {
        Self::Array(items)
    }
}
