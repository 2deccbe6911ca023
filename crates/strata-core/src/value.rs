//! Dynamically shaped payloads carried through the namespace
//!
//! Everything pushed to or fetched from the naming layer is a [`Value`]: a
//! tagged union of scalars, maps, sequences and references to other paths.
//! Values cross the cache and RPC boundaries as-is; typed views are produced
//! with [`Value::decode`] and built with [`Value::encode`].
//!
//! # Wire form
//!
//! Values serialize to the natural self-describing shape (JSON object, array,
//! string, number...). Path references serialize as a single-entry map
//! `{"$path": [segments...]}` and are recognised again on the way back in.
//! Map keys starting with `$` are escaped with one more `$`, so a user map
//! that looks like a reference still deserializes as a map.
//!
//! The `serde_json::Value` conversions do not escape: a JSON object whose
//! only key is `"$path"` with a string-array value converts to
//! [`Value::Path`].

use crate::errors::{Result, StrataError};
use crate::path::Path;
use serde::de::{self, DeserializeOwned, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

/// Map key marking a serialized path reference
pub const PATH_REFERENCE_KEY: &str = "$path";

/// Leaf values
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    /// Absent value
    Null,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Floating point number
    Float(f64),
    /// UTF-8 string
    String(String),
    /// Opaque bytes
    Bytes(Vec<u8>),
}

/// Decoded payload stored under a path
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Leaf value
    Scalar(Scalar),
    /// String-keyed map
    Map(BTreeMap<String, Value>),
    /// Ordered sequence
    Sequence(Vec<Value>),
    /// Reference to another path in the namespace
    Path(Path),
}

impl Default for Value {
    fn default() -> Self {
        Self::null()
    }
}

impl Value {
    /// The null value
    pub fn null() -> Self {
        Self::Scalar(Scalar::Null)
    }

    /// Whether this is `Scalar::Null`
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Scalar(Scalar::Null))
    }

    /// Borrow as a string slice
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Scalar(Scalar::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Read as a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Scalar(Scalar::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// Read as a signed integer
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Scalar(Scalar::Int(i)) => Some(*i),
            _ => None,
        }
    }

    /// Borrow as a map
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Borrow as a sequence
    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Self::Sequence(items) => Some(items),
            _ => None,
        }
    }

    /// Read opaque bytes. Sequences of small integers and strings are
    /// accepted too, since text encodings carry bytes that way.
    pub fn as_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Self::Scalar(Scalar::Bytes(bytes)) => Some(bytes.clone()),
            Self::Scalar(Scalar::String(s)) => Some(s.as_bytes().to_vec()),
            Self::Sequence(items) => items
                .iter()
                .map(|item| item.as_i64().and_then(|i| u8::try_from(i).ok()))
                .collect(),
            _ => None,
        }
    }

    /// Map member lookup
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|map| map.get(key))
    }

    /// Read a sequence of strings
    pub fn as_string_array(&self) -> Option<Vec<String>> {
        self.as_sequence()?
            .iter()
            .map(|item| item.as_str().map(str::to_owned))
            .collect()
    }

    /// Replace every nested path reference with its canonical string form
    pub fn flatten(&self) -> Value {
        match self {
            Self::Scalar(scalar) => Self::Scalar(scalar.clone()),
            Self::Map(map) => Self::Map(
                map.iter()
                    .map(|(key, value)| (key.clone(), value.flatten()))
                    .collect(),
            ),
            Self::Sequence(items) => Self::Sequence(items.iter().map(Value::flatten).collect()),
            Self::Path(path) => Self::Scalar(Scalar::String(path.to_key())),
        }
    }

    /// Structural decode into a typed value
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.flatten().to_json()).map_err(|e| {
            StrataError::serialization(format!(
                "cannot decode value into {}: {e}",
                std::any::type_name::<T>()
            ))
        })
    }

    /// Build a value from any serializable type
    pub fn encode<T: Serialize>(value: &T) -> Result<Value> {
        Ok(Value::from(serde_json::to_value(value)?))
    }

    /// Convert to a `serde_json::Value`. Bytes become arrays of numbers.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Self::Scalar(Scalar::Null) => Json::Null,
            Self::Scalar(Scalar::Bool(b)) => Json::Bool(*b),
            Self::Scalar(Scalar::Int(i)) => Json::from(*i),
            Self::Scalar(Scalar::Float(f)) => Json::from(*f),
            Self::Scalar(Scalar::String(s)) => Json::String(s.clone()),
            Self::Scalar(Scalar::Bytes(bytes)) => {
                Json::Array(bytes.iter().map(|b| Json::from(*b)).collect())
            }
            Self::Map(map) => Json::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
            Self::Sequence(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Self::Path(path) => {
                let mut object = serde_json::Map::new();
                object.insert(
                    PATH_REFERENCE_KEY.to_string(),
                    Json::Array(
                        path.segments()
                            .iter()
                            .map(|s| Json::String(s.clone()))
                            .collect(),
                    ),
                );
                Json::Object(object)
            }
        }
    }

    fn from_map(map: BTreeMap<String, Value>) -> Value {
        if map.len() == 1 {
            if let Some(segments) = map
                .get(PATH_REFERENCE_KEY)
                .and_then(Value::as_string_array)
            {
                return Value::Path(Path::from(segments));
            }
        }
        Value::Map(map)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::null(),
            Json::Bool(b) => b.into(),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Scalar(Scalar::Int(i)),
                None => Value::Scalar(Scalar::Float(n.as_f64().unwrap_or(f64::NAN))),
            },
            Json::String(s) => s.into(),
            Json::Array(items) => Value::Sequence(items.into_iter().map(Value::from).collect()),
            Json::Object(object) => Value::from_map(
                object
                    .into_iter()
                    .map(|(key, value)| (key, Value::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Scalar(Scalar::Bool(b))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Scalar(Scalar::Int(i))
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Scalar(Scalar::Int(i64::from(i)))
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        match i64::try_from(i) {
            Ok(i) => Value::Scalar(Scalar::Int(i)),
            Err(_) => Value::Scalar(Scalar::Float(i as f64)),
        }
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Scalar(Scalar::Float(f))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Scalar(Scalar::String(s.to_string()))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Scalar(Scalar::String(s))
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Scalar(Scalar::Bytes(bytes))
    }
}

impl From<Path> for Value {
    fn from(path: Path) -> Self {
        Value::Path(path)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Sequence(items)
    }
}

impl From<Vec<String>> for Value {
    fn from(items: Vec<String>) -> Self {
        Value::Sequence(items.into_iter().map(Value::from).collect())
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Map(map)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Scalar(Scalar::Null) => serializer.serialize_unit(),
            Value::Scalar(Scalar::Bool(b)) => serializer.serialize_bool(*b),
            Value::Scalar(Scalar::Int(i)) => serializer.serialize_i64(*i),
            Value::Scalar(Scalar::Float(f)) => serializer.serialize_f64(*f),
            Value::Scalar(Scalar::String(s)) => serializer.serialize_str(s),
            Value::Scalar(Scalar::Bytes(bytes)) => serializer.serialize_bytes(bytes),
            Value::Map(map) => {
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (key, value) in map {
                    out.serialize_entry(&*escape_key(key), value)?;
                }
                out.end()
            }
            Value::Sequence(items) => {
                let mut out = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    out.serialize_element(item)?;
                }
                out.end()
            }
            Value::Path(path) => {
                let mut out = serializer.serialize_map(Some(1))?;
                out.serialize_entry(PATH_REFERENCE_KEY, path.segments())?;
                out.end()
            }
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("any namespace value")
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<Value, E> {
        Ok(Value::null())
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<Value, E> {
        Ok(Value::null())
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> std::result::Result<Value, D::Error> {
        Value::deserialize(d)
    }

    fn visit_bool<E: de::Error>(self, b: bool) -> std::result::Result<Value, E> {
        Ok(b.into())
    }

    fn visit_i64<E: de::Error>(self, i: i64) -> std::result::Result<Value, E> {
        Ok(i.into())
    }

    fn visit_u64<E: de::Error>(self, u: u64) -> std::result::Result<Value, E> {
        Ok(match i64::try_from(u) {
            Ok(i) => i.into(),
            Err(_) => (u as f64).into(),
        })
    }

    fn visit_f64<E: de::Error>(self, f: f64) -> std::result::Result<Value, E> {
        Ok(f.into())
    }

    fn visit_str<E: de::Error>(self, s: &str) -> std::result::Result<Value, E> {
        Ok(s.into())
    }

    fn visit_string<E: de::Error>(self, s: String) -> std::result::Result<Value, E> {
        Ok(s.into())
    }

    fn visit_bytes<E: de::Error>(self, bytes: &[u8]) -> std::result::Result<Value, E> {
        Ok(bytes.to_vec().into())
    }

    fn visit_byte_buf<E: de::Error>(self, bytes: Vec<u8>) -> std::result::Result<Value, E> {
        Ok(bytes.into())
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Value::Sequence(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Value, A::Error> {
        let mut map = BTreeMap::new();
        while let Some((key, value)) = access.next_entry::<String, Value>()? {
            map.insert(key, value);
        }
        if map.len() == 1 {
            if let Some(segments) = map
                .get(PATH_REFERENCE_KEY)
                .and_then(Value::as_string_array)
            {
                return Ok(Value::Path(Path::from(segments)));
            }
        }
        Ok(Value::Map(
            map.into_iter()
                .map(|(key, value)| (unescape_key(key), value))
                .collect(),
        ))
    }
}

fn escape_key(key: &str) -> Cow<'_, str> {
    if key.starts_with('$') {
        Cow::Owned(format!("${key}"))
    } else {
        Cow::Borrowed(key)
    }
}

fn unescape_key(key: String) -> String {
    match key.strip_prefix('$') {
        Some(rest) if rest.starts_with('$') => rest.to_string(),
        _ => key,
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn nested() -> Value {
        let mut inner = BTreeMap::new();
        inner.insert("name".to_string(), Value::from("fn1"));
        inner.insert("memory".to_string(), Value::from(128i64));
        inner.insert("ratio".to_string(), Value::from(0.5));
        let mut outer = BTreeMap::new();
        outer.insert("function".to_string(), Value::Map(inner));
        outer.insert(
            "tags".to_string(),
            Value::from(vec!["a".to_string(), "b".to_string()]),
        );
        outer.insert("enabled".to_string(), Value::from(true));
        outer.insert("missing".to_string(), Value::null());
        Value::Map(outer)
    }

    #[test]
    fn json_text_preserves_nested_values() {
        let value = nested();
        let text = serde_json::to_string(&value).unwrap();
        let back: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn path_reference_is_recognised() {
        let value = Value::Sequence(vec![Value::Path(Path::from(["a", "b"]))]);
        let text = serde_json::to_string(&value).unwrap();
        assert_eq!(text, r#"[{"$path":["a","b"]}]"#);
        let back: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn dollar_keys_are_escaped_on_the_wire() {
        let mut map = BTreeMap::new();
        map.insert(
            PATH_REFERENCE_KEY.to_string(),
            Value::from(vec!["a".to_string(), "b".to_string()]),
        );
        let value = Value::Map(map);
        let text = serde_json::to_string(&value).unwrap();
        assert_eq!(text, r#"{"$$path":["a","b"]}"#);
        let back: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(back, value);

        let mut map = BTreeMap::new();
        map.insert("$$x".to_string(), Value::from(1i64));
        map.insert("$".to_string(), Value::from(2i64));
        map.insert("plain".to_string(), Value::from(3i64));
        let value = Value::Map(map);
        let back: Value = serde_json::from_str(&serde_json::to_string(&value).unwrap()).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn flatten_replaces_references_with_keys() {
        let value = Value::Sequence(vec![Value::Path(Path::from(["a", "b"])), Value::from(1i64)]);
        assert_eq!(
            value.flatten(),
            Value::Sequence(vec![Value::from("/a/b"), Value::from(1i64)])
        );
    }

    #[test]
    fn decode_into_struct() {
        #[derive(Deserialize, Debug, PartialEq)]
        struct Function {
            name: String,
            memory: u32,
        }

        let value = nested();
        let function: Function = value.get("function").unwrap().decode().unwrap();
        assert_eq!(
            function,
            Function {
                name: "fn1".into(),
                memory: 128
            }
        );
    }

    #[test]
    fn decode_mismatch_is_descriptive() {
        let err = Value::from("text").decode::<u32>().unwrap_err();
        assert!(matches!(err, StrataError::Serialization { .. }));
    }

    #[test]
    fn bytes_accept_integer_sequences() {
        let value = Value::Sequence(vec![Value::from(1i64), Value::from(255i64)]);
        assert_eq!(value.as_bytes(), Some(vec![1, 255]));
        let value = Value::Sequence(vec![Value::from(300i64)]);
        assert_eq!(value.as_bytes(), None);
    }

    #[test]
    fn string_array_requires_every_item_to_be_a_string() {
        let keys = Value::from(vec!["/a".to_string(), "/b".to_string()]);
        assert_eq!(keys.as_string_array().unwrap(), vec!["/a", "/b"]);
        let mixed = Value::Sequence(vec![Value::from("/a"), Value::from(1i64)]);
        assert!(mixed.as_string_array().is_none());
    }
}
