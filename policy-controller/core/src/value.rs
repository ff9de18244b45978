//! A closed document type for comparing untyped objects.
//!
//! Integers keep their original representation so that a merge never turns
//! an `int64` field into a float.

use indexmap::IndexMap;
use std::fmt;

pub type Map = IndexMap<String, Value>;

#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Seq(Vec<Value>),
    Map(Map),
}

/// The broad shape of a value, used to detect re-typed fields.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Kind {
    Null,
    Scalar,
    Seq,
    Map,
}

// === impl Value ===

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Self::Null => Kind::Null,
            Self::Seq(_) => Kind::Seq,
            Self::Map(_) => Kind::Map,
            _ => Kind::Scalar,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut Map> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Looks up a value by a path of map keys.
    pub fn pointer(&self, path: &[&str]) -> Option<&Value> {
        path.iter()
            .try_fold(self, |v, key| v.as_map().and_then(|m| m.get(*key)))
    }

    pub fn str_at(&self, path: &[&str]) -> Option<&str> {
        self.pointer(path).and_then(Value::as_str)
    }

    fn as_i128(&self) -> Option<i128> {
        match *self {
            Self::Int(i) => Some(i as i128),
            Self::UInt(u) => Some(u as i128),
            Self::Float(f) if f.fract() == 0.0 && f.abs() < 1e38 => Some(f as i128),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Int(_) | Self::UInt(_), Self::Int(_) | Self::UInt(_) | Self::Float(_))
            | (Self::Float(_), Self::Int(_) | Self::UInt(_)) => {
                match (self.as_i128(), other.as_i128()) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                }
            }
            (Self::Seq(a), Self::Seq(b)) => a == b,
            // `IndexMap` equality ignores ordering.
            (Self::Map(a), Self::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match value {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::Bool(b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Self::UInt(u)
                } else {
                    Self::Float(n.as_f64().unwrap_or_default())
                }
            }
            Json::String(s) => Self::String(s),
            Json::Array(items) => Self::Seq(items.into_iter().map(Into::into).collect()),
            Json::Object(map) => Self::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect()),
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        use serde_json::Value as Json;
        match value {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(b),
            Value::Int(i) => Json::from(i),
            Value::UInt(u) => Json::from(u),
            Value::Float(f) => serde_json::Number::from_f64(f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::String(s) => Json::String(s),
            Value::Seq(items) => Json::Array(items.into_iter().map(Into::into).collect()),
            Value::Map(map) => Json::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Renders values compactly, as JSON, for diff descriptions.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::UInt(u) => write!(f, "{u}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Seq(_) | Self::Map(_) => {
                let json = serde_json::Value::from(self.clone());
                write!(f, "{json}")
            }
        }
    }
}

/// Builds a [`Value`] from JSON literal syntax.
#[macro_export]
macro_rules! doc {
    ($($json:tt)+) => {
        $crate::Value::from(::serde_json::json!($($json)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_integer_representation() {
        let v = Value::from(serde_json::json!({ "big": 9_007_199_254_740_993_i64, "u": u64::MAX }));
        let map = v.as_map().unwrap();
        assert!(matches!(map["big"], Value::Int(9_007_199_254_740_993)));
        assert!(matches!(map["u"], Value::UInt(u64::MAX)));

        let back = serde_json::Value::from(v);
        assert_eq!(back["big"].as_i64(), Some(9_007_199_254_740_993));
        assert!(back["big"].is_i64());
    }

    #[test]
    fn map_equality_ignores_order() {
        assert_eq!(doc!({ "a": 1, "b": 2 }), doc!({ "b": 2, "a": 1 }));
        assert_ne!(doc!({ "a": 1 }), doc!({ "a": 1, "b": 2 }));
    }

    #[test]
    fn numbers_compare_by_value() {
        assert_eq!(Value::Int(3), Value::UInt(3));
        assert_eq!(Value::Int(3), Value::Float(3.0));
        assert_ne!(Value::Int(3), Value::Float(3.5));
        assert_ne!(Value::Int(3), Value::String("3".into()));
    }

    #[test]
    fn looks_up_paths() {
        let v = doc!({ "metadata": { "name": "foo" } });
        assert_eq!(v.str_at(&["metadata", "name"]), Some("foo"));
        assert_eq!(v.str_at(&["metadata", "namespace"]), None);
    }
}
