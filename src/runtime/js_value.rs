//! Host-side value model for engine values.
//!
//! `JSValue` is what work items hand across the dispatcher boundary instead of
//! handles: a plain, `Send` snapshot of an engine value that can represent
//! NaN, ±Infinity, `undefined` and byte buffers, with depth/size limits
//! enforced while it is built.

use crate::runtime::error::{Result, RuntimeError};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Snapshot of an engine value.
///
/// The Serialize/Deserialize implementations are written by hand: `Undefined`
/// serializes like `Null`, `Error` as `{"error": message}` and deserialization
/// never produces `Undefined`, `Bytes` or `Error`.
#[derive(Clone, Debug, PartialEq)]
pub enum JSValue {
    Undefined,
    Null,
    Bool(bool),
    /// Integral number within i64 range
    Int(i64),
    /// Any other number, including NaN and ±Infinity
    Float(f64),
    String(String),
    /// Contents of an ArrayBuffer
    Bytes(Vec<u8>),
    Array(Vec<JSValue>),
    /// Object properties in insertion order
    Object(IndexMap<String, JSValue>),
    /// Engine error object, carried as its message
    Error { message: String },
}

impl JSValue {
    pub fn error(message: impl Into<String>) -> Self {
        JSValue::Error {
            message: message.into(),
        }
    }

    /// Classify an engine number as `Int` when it is integral and in range.
    pub fn from_number(value: f64) -> Self {
        if value.is_finite()
            && value.fract() == 0.0
            && value >= i64::MIN as f64
            && value <= i64::MAX as f64
            && !(value == 0.0 && value.is_sign_negative())
        {
            JSValue::Int(value as i64)
        } else {
            JSValue::Float(value)
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            JSValue::Int(i) => Some(*i as f64),
            JSValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            JSValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, JSValue::Undefined | JSValue::Null)
    }
}

impl fmt::Display for JSValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JSValue::Undefined => f.write_str("undefined"),
            JSValue::Null => f.write_str("null"),
            JSValue::Bool(b) => write!(f, "{}", b),
            JSValue::Int(i) => write!(f, "{}", i),
            JSValue::Float(v) if v.is_nan() => f.write_str("NaN"),
            JSValue::Float(v) if v.is_infinite() => {
                f.write_str(if *v > 0.0 { "Infinity" } else { "-Infinity" })
            }
            JSValue::Float(v) => write!(f, "{}", v),
            JSValue::String(s) => f.write_str(s),
            JSValue::Bytes(b) => write!(f, "[ArrayBuffer {} bytes]", b.len()),
            JSValue::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            JSValue::Object(_) => f.write_str("[object Object]"),
            JSValue::Error { message } => write!(f, "Error: {}", message),
        }
    }
}

impl Serialize for JSValue {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;
        match self {
            JSValue::Undefined | JSValue::Null => serializer.serialize_none(),
            JSValue::Bool(b) => serializer.serialize_bool(*b),
            JSValue::Int(i) => serializer.serialize_i64(*i),
            JSValue::Float(f) => serializer.serialize_f64(*f),
            JSValue::String(s) => serializer.serialize_str(s),
            JSValue::Bytes(b) => b.serialize(serializer),
            JSValue::Array(arr) => arr.serialize(serializer),
            JSValue::Object(obj) => obj.serialize(serializer),
            JSValue::Error { message } => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("error", message)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for JSValue {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct JSValueVisitor;

        impl<'de> Visitor<'de> for JSValueVisitor {
            type Value = JSValue;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a null, bool, number, string, array, or object")
            }

            fn visit_bool<E>(self, value: bool) -> std::result::Result<Self::Value, E> {
                Ok(JSValue::Bool(value))
            }

            fn visit_i64<E>(self, value: i64) -> std::result::Result<Self::Value, E> {
                Ok(JSValue::Int(value))
            }

            fn visit_u64<E>(self, value: u64) -> std::result::Result<Self::Value, E> {
                if value <= i64::MAX as u64 {
                    Ok(JSValue::Int(value as i64))
                } else {
                    Ok(JSValue::Float(value as f64))
                }
            }

            fn visit_f64<E>(self, value: f64) -> std::result::Result<Self::Value, E> {
                Ok(JSValue::Float(value))
            }

            fn visit_str<E>(self, value: &str) -> std::result::Result<Self::Value, E> {
                Ok(JSValue::String(value.to_owned()))
            }

            fn visit_string<E>(self, value: String) -> std::result::Result<Self::Value, E> {
                Ok(JSValue::String(value))
            }

            fn visit_none<E>(self) -> std::result::Result<Self::Value, E> {
                Ok(JSValue::Null)
            }

            fn visit_unit<E>(self) -> std::result::Result<Self::Value, E> {
                Ok(JSValue::Null)
            }

            fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut vec = Vec::new();
                while let Some(elem) = seq.next_element()? {
                    vec.push(elem);
                }
                Ok(JSValue::Array(vec))
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: de::MapAccess<'de>,
            {
                let mut obj = IndexMap::new();
                while let Some((key, value)) = map.next_entry()? {
                    obj.insert(key, value);
                }
                Ok(JSValue::Object(obj))
            }
        }

        deserializer.deserialize_any(JSValueVisitor)
    }
}

/// Tracks depth and size limits while converting between handles and
/// `JSValue`s.
pub struct LimitTracker {
    max_depth: usize,
    max_bytes: usize,
    current_depth: usize,
    current_bytes: usize,
}

impl LimitTracker {
    pub fn new(max_depth: usize, max_bytes: usize) -> Self {
        Self {
            max_depth,
            max_bytes,
            current_depth: 0,
            current_bytes: 0,
        }
    }

    /// Enter a new depth level.
    pub fn enter(&mut self) -> Result<()> {
        self.current_depth += 1;
        if self.current_depth > self.max_depth {
            return Err(RuntimeError::Conversion(format!(
                "depth exceeded maximum limit of {}",
                self.max_depth
            )));
        }
        Ok(())
    }

    pub fn exit(&mut self) {
        self.current_depth = self.current_depth.saturating_sub(1);
    }

    pub fn add_bytes(&mut self, bytes: usize) -> Result<()> {
        self.current_bytes += bytes;
        if self.current_bytes > self.max_bytes {
            return Err(RuntimeError::Conversion(format!(
                "size ({} bytes) exceeded maximum limit of {} bytes",
                self.current_bytes, self.max_bytes
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_classification() {
        assert_eq!(JSValue::from_number(42.0), JSValue::Int(42));
        assert_eq!(JSValue::from_number(2.5), JSValue::Float(2.5));
        assert!(matches!(JSValue::from_number(f64::NAN), JSValue::Float(v) if v.is_nan()));
        assert!(matches!(JSValue::from_number(-0.0), JSValue::Float(_)));
        assert_eq!(
            JSValue::from_number(f64::INFINITY),
            JSValue::Float(f64::INFINITY)
        );
    }

    #[test]
    fn test_display_matches_engine_stringification() {
        assert_eq!(JSValue::Undefined.to_string(), "undefined");
        assert_eq!(JSValue::Float(f64::NEG_INFINITY).to_string(), "-Infinity");
        assert_eq!(
            JSValue::Array(vec![JSValue::Int(1), JSValue::String("a".into())]).to_string(),
            "[1,a]"
        );
        assert_eq!(JSValue::error("boom").to_string(), "Error: boom");
    }

    #[test]
    fn test_serialize_special_variants() {
        let mut map = IndexMap::new();
        map.insert("u".to_string(), JSValue::Undefined);
        map.insert("e".to_string(), JSValue::error("bad"));
        map.insert("b".to_string(), JSValue::Bytes(vec![1, 2]));
        let json = serde_json::to_string(&JSValue::Object(map)).unwrap();
        assert_eq!(json, r#"{"u":null,"e":{"error":"bad"},"b":[1,2]}"#);
    }

    #[test]
    fn test_deserialize_preserves_key_order() {
        let value: JSValue = serde_json::from_str(r#"{"z":1,"a":[true,null,"s"]}"#).unwrap();
        let JSValue::Object(map) = value else {
            panic!("expected object");
        };
        let keys: Vec<_> = map.keys().cloned().collect();
        assert_eq!(keys, vec!["z", "a"]);
        assert_eq!(
            map["a"],
            JSValue::Array(vec![
                JSValue::Bool(true),
                JSValue::Null,
                JSValue::String("s".into())
            ])
        );
    }

    #[test]
    fn test_limit_tracker_depth_exceeded() {
        let mut tracker = LimitTracker::new(3, 1000);

        assert!(tracker.enter().is_ok());
        assert!(tracker.enter().is_ok());
        assert!(tracker.enter().is_ok());
        assert!(matches!(tracker.enter(), Err(RuntimeError::Conversion(_))));
    }

    #[test]
    fn test_limit_tracker_size_exceeded() {
        let mut tracker = LimitTracker::new(10, 100);

        assert!(tracker.add_bytes(50).is_ok());
        assert!(tracker.add_bytes(40).is_ok());
        assert!(tracker.add_bytes(20).is_err());
    }
}
