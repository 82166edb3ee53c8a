//! Dynamically typed status values
//!
//! Every status object carries a [`Value`]. Sensors and actuators declare a
//! [`ValueKind`] and incoming requests are coerced to it before they reach
//! the delay state machine.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// Error returned when a value cannot be coerced to a declared kind
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValueError {
    #[error("cannot convert {value} to {kind}")]
    Coercion { value: Value, kind: ValueKind },

    #[error("value {0} is not a number")]
    NotANumber(Value),
}

/// Result type for value conversions
pub type ValueResult<T> = Result<T, ValueError>;

/// A status value
///
/// Numbers compare across `Int`/`Float`/`Bool` the way a person would expect
/// (`1 == 1.0 == true`), strings compare lexically, and anything else is
/// unordered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum Value {
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
}

impl Value {
    /// Truthiness used by conditions
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
        }
    }

    /// Numeric view of the value, if it has one
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Integer view of the value (floats are truncated)
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.is_finite() => Some(f.trunc() as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Bool(_) | Value::Int(_) | Value::Float(_))
    }

    /// Require a numeric value
    pub fn number(&self) -> ValueResult<f64> {
        self.as_f64()
            .ok_or_else(|| ValueError::NotANumber(self.clone()))
    }

    /// Arithmetic negation
    pub fn negate(&self) -> ValueResult<Value> {
        match self {
            Value::Int(i) => Ok(Value::Int(-i)),
            Value::Bool(b) => Ok(Value::Int(-i64::from(*b))),
            Value::Float(f) => Ok(Value::Float(-f)),
            other => Err(ValueError::NotANumber(other.clone())),
        }
    }

    /// Flatten nested lists into a single sequence of scalars
    pub fn flatten(&self) -> Vec<Value> {
        match self {
            Value::List(items) => items.iter().flat_map(Value::flatten).collect(),
            other => vec![other.clone()],
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (a, b) if a.is_numeric() && b.is_numeric() => a.as_f64() == b.as_f64(),
            _ => false,
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => a.partial_cmp(b),
            (a, b) if a.is_numeric() && b.is_numeric() => {
                a.as_f64().partial_cmp(&b.as_f64())
            }
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Value::None)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::None,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            // Mappings have no status representation; keep their text form
            obj @ serde_json::Value::Object(_) => Value::Str(obj.to_string()),
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::None => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(i) => serde_json::Value::from(i),
            Value::Float(x) => serde_json::Number::from_f64(x)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s),
            Value::List(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
        }
    }
}

/// Declared type of a status object
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    #[default]
    Any,
    Bool,
    Int,
    Float,
    Str,
}

impl ValueKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "any" => Some(ValueKind::Any),
            "bool" => Some(ValueKind::Bool),
            "int" => Some(ValueKind::Int),
            "float" => Some(ValueKind::Float),
            "str" => Some(ValueKind::Str),
            _ => None,
        }
    }

    /// The value a fresh object of this kind starts with
    pub fn initial(self) -> Value {
        match self {
            ValueKind::Any => Value::None,
            ValueKind::Bool => Value::Bool(false),
            ValueKind::Int => Value::Int(0),
            ValueKind::Float => Value::Float(0.0),
            ValueKind::Str => Value::Str(String::new()),
        }
    }

    /// Coerce a value into this kind
    pub fn coerce(self, value: Value) -> ValueResult<Value> {
        let fail = |value: Value| ValueError::Coercion { value, kind: self };
        match self {
            ValueKind::Any => Ok(value),
            ValueKind::Bool => Ok(Value::Bool(value.is_truthy())),
            ValueKind::Int => match &value {
                Value::Str(s) => s
                    .trim()
                    .parse::<i64>()
                    .ok()
                    .or_else(|| {
                        s.trim()
                            .parse::<f64>()
                            .ok()
                            .filter(|f| f.is_finite())
                            .map(|f| f.trunc() as i64)
                    })
                    .map(Value::Int)
                    .ok_or_else(|| fail(value.clone())),
                other => other.as_i64().map(Value::Int).ok_or_else(|| fail(value.clone())),
            },
            ValueKind::Float => match &value {
                Value::Str(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::Float)
                    .map_err(|_| fail(value.clone())),
                other => other.as_f64().map(Value::Float).ok_or_else(|| fail(value.clone())),
            },
            ValueKind::Str => match value {
                Value::None => Err(fail(Value::None)),
                Value::Str(s) => Ok(Value::Str(s)),
                other => Ok(Value::Str(other.to_string())),
            },
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Any => "any",
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Str => "str",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_equality_across_variants() {
        assert_eq!(Value::Int(1), Value::Float(1.0));
        assert_eq!(Value::Bool(true), Value::Int(1));
        assert_ne!(Value::Str("1".into()), Value::Int(1));
        assert_eq!(Value::None, Value::None);
    }

    #[test]
    fn test_ordering() {
        assert!(Value::Int(2) > Value::Float(1.5));
        assert!(Value::Str("b".into()) > Value::Str("a".into()));
        assert_eq!(Value::Str("a".into()).partial_cmp(&Value::Int(1)), None);
        assert_eq!(Value::None.partial_cmp(&Value::Bool(false)), None);
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::None.is_truthy());
        assert!(!Value::Float(0.0).is_truthy());
        assert!(Value::Str("x".into()).is_truthy());
        assert!(!Value::List(vec![]).is_truthy());
    }

    #[test]
    fn test_coerce_int() {
        assert_eq!(ValueKind::Int.coerce(Value::Float(2.9)).unwrap(), Value::Int(2));
        assert_eq!(ValueKind::Int.coerce("12".into()).unwrap(), Value::Int(12));
        assert_eq!(ValueKind::Int.coerce("3.7".into()).unwrap(), Value::Int(3));
        assert!(ValueKind::Int.coerce("abc".into()).is_err());
        assert!(ValueKind::Int.coerce(Value::None).is_err());
    }

    #[test]
    fn test_coerce_bool_and_str() {
        assert_eq!(ValueKind::Bool.coerce(Value::Int(5)).unwrap(), Value::Bool(true));
        assert_eq!(ValueKind::Bool.coerce(Value::None).unwrap(), Value::Bool(false));
        assert_eq!(
            ValueKind::Str.coerce(Value::Float(1.5)).unwrap(),
            Value::Str("1.5".into())
        );
    }

    #[test]
    fn test_json_roundtrip_shapes() {
        let v: Value = serde_json::from_str("[1, 2.5, \"x\", null, true]").unwrap();
        assert_eq!(
            v,
            Value::List(vec![
                Value::Int(1),
                Value::Float(2.5),
                Value::Str("x".into()),
                Value::None,
                Value::Bool(true)
            ])
        );
        assert_eq!(serde_json::to_string(&Value::Int(3)).unwrap(), "3");
    }
}
