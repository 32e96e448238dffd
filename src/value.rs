//! Dynamically-typed msgpack values exchanged with Neovim.
//!
//! [`Value`] is the payload unit of every request argument, response result
//! and notification payload. It is a closed union mirroring the msgpack type
//! system; callers downcast with the `as_*`/`into_*` helpers, or go through
//! serde with [`to_value`] / [`from_value`].
//!
//! Values produced by the decoder are owned and never mutated afterwards.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::rpc::RpcError;

pub use rmpv::Integer;

/// A decoded msgpack value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    /// Signed or unsigned 64-bit integer.
    Integer(Integer),
    F32(f32),
    F64(f64),
    String(String),
    /// Raw bytes. Also used for msgpack strings that are not valid UTF-8.
    Binary(Vec<u8>),
    Array(Vec<Value>),
    /// Ordered key/value association. Keys are not required to be unique.
    Map(Vec<(Value, Value)>),
    /// Application-defined extension type (Neovim uses these for
    /// Buffer/Window/Tabpage handles).
    Ext(i8, Vec<u8>),
}

impl Value {
    /// Short name of the variant, used in conversion error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::F32(_) | Value::F64(_) => "float",
            Value::String(_) => "string",
            Value::Binary(_) => "binary",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Ext(..) => "ext",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer value as `i64`, if it is an integer that fits.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => n.as_i64(),
            _ => None,
        }
    }

    /// Integer value as `u64`, if it is a non-negative integer.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Integer(n) => n.as_u64(),
            _ => None,
        }
    }

    /// Numeric value as `f64`. Integers are widened.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F32(f) => Some(f64::from(*f)),
            Value::F64(f) => Some(*f),
            Value::Integer(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Byte view of string and binary values.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::String(s) => Some(s.as_bytes()),
            Value::Binary(b) | Value::Ext(_, b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Look up the first entry of a map whose key is the string `key`.
    ///
    /// Neovim dictionaries (autocmd event data, `nvim_exec2` results) are
    /// string-keyed, so this covers the common access pattern.
    pub fn map_get(&self, key: &str) -> Option<&Value> {
        self.as_map()?
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }

    /// Convert into a `serde_json::Value` for human-facing output.
    ///
    /// Binary and ext payloads become arrays of bytes and non-string map keys
    /// are rendered with `Display`, so the conversion is lossy.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;

        match self {
            Value::Nil => Json::Null,
            Value::Boolean(b) => Json::Bool(*b),
            Value::Integer(n) => match (n.as_i64(), n.as_u64()) {
                (Some(i), _) => Json::from(i),
                (None, Some(u)) => Json::from(u),
                (None, None) => Json::Null,
            },
            Value::F32(f) => Json::from(f64::from(*f)),
            Value::F64(f) => Json::from(*f),
            Value::String(s) => Json::String(s.clone()),
            Value::Binary(b) | Value::Ext(_, b) => {
                Json::Array(b.iter().map(|byte| Json::from(*byte)).collect())
            }
            Value::Array(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(entries) => Json::Object(
                entries
                    .iter()
                    .map(|(k, v)| {
                        let key = match k {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (key, v.to_json())
                    })
                    .collect(),
            ),
        }
    }

    /// Build a value from JSON (used by the CLI for call arguments).
    pub fn from_json(json: &serde_json::Value) -> Value {
        use serde_json::Value as Json;

        match json {
            Json::Null => Value::Nil,
            Json::Bool(b) => Value::Boolean(*b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::from(i)
                } else if let Some(u) = n.as_u64() {
                    Value::from(u)
                } else {
                    Value::F64(n.as_f64().unwrap_or_default())
                }
            }
            Json::String(s) => Value::String(s.clone()),
            Json::Array(items) => Value::Array(items.iter().map(Value::from_json).collect()),
            Json::Object(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (Value::String(k.clone()), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Integer(n) => write!(f, "{n}"),
            Value::F32(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Binary(b) => write!(f, "<binary {} bytes>", b.len()),
            Value::Ext(ty, b) => write!(f, "<ext {ty}: {} bytes>", b.len()),
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Map(entries) => {
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

// =============================================================================
// msgpack bridge
// =============================================================================

impl From<rmpv::Value> for Value {
    fn from(value: rmpv::Value) -> Self {
        match value {
            rmpv::Value::Nil => Value::Nil,
            rmpv::Value::Boolean(b) => Value::Boolean(b),
            rmpv::Value::Integer(n) => Value::Integer(n),
            rmpv::Value::F32(f) => Value::F32(f),
            rmpv::Value::F64(f) => Value::F64(f),
            rmpv::Value::String(s) => match String::from_utf8(s.into_bytes()) {
                Ok(s) => Value::String(s),
                Err(e) => Value::Binary(e.into_bytes()),
            },
            rmpv::Value::Binary(b) => Value::Binary(b),
            rmpv::Value::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            rmpv::Value::Map(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (Value::from(k), Value::from(v)))
                    .collect(),
            ),
            rmpv::Value::Ext(ty, data) => Value::Ext(ty, data),
        }
    }
}

impl From<Value> for rmpv::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Nil => rmpv::Value::Nil,
            Value::Boolean(b) => rmpv::Value::Boolean(b),
            Value::Integer(n) => rmpv::Value::Integer(n),
            Value::F32(f) => rmpv::Value::F32(f),
            Value::F64(f) => rmpv::Value::F64(f),
            Value::String(s) => rmpv::Value::String(s.into()),
            Value::Binary(b) => rmpv::Value::Binary(b),
            Value::Array(items) => {
                rmpv::Value::Array(items.into_iter().map(rmpv::Value::from).collect())
            }
            Value::Map(entries) => rmpv::Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (rmpv::Value::from(k), rmpv::Value::from(v)))
                    .collect(),
            ),
            Value::Ext(ty, data) => rmpv::Value::Ext(ty, data),
        }
    }
}

// =============================================================================
// serde bridge
// =============================================================================

/// Serialize any `Serialize` type into a [`Value`].
///
/// Note that structs serialize as arrays of their fields (msgpack tuple
/// encoding). Use a map type for Neovim option dictionaries.
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value, RpcError> {
    rmpv::ext::to_value(value)
        .map(Value::from)
        .map_err(|e| RpcError::Convert(format!("failed to serialize argument: {e}")))
}

/// Deserialize a [`Value`] into any `DeserializeOwned` type.
pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, RpcError> {
    let type_name = value.type_name();
    rmpv::ext::from_value(rmpv::Value::from(value))
        .map_err(|e| RpcError::Convert(format!("cannot convert {type_name} result: {e}")))
}

// =============================================================================
// Conversions from Rust types
// =============================================================================

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

macro_rules! impl_from_integer {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(n: $t) -> Self {
                    Value::Integer(Integer::from(n))
                }
            }
        )*
    };
}

impl_from_integer!(i8, i16, i32, i64, u8, u16, u32, u64);

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Integer(Integer::from(n as u64))
    }
}

impl From<f32> for Value {
    fn from(f: f32) -> Self {
        Value::F32(f)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::F64(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Binary(b.to_vec())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Value::Nil, Into::into)
    }
}

impl<K: Into<Value>, V: Into<Value>> FromIterator<(K, V)> for Value {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Value::Map(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    #[test]
    fn test_integer_accessors() {
        let v = Value::from(20);
        assert_eq!(v.as_i64(), Some(20));
        assert_eq!(v.as_u64(), Some(20));
        assert_eq!(v.as_f64(), Some(20.0));
        assert_eq!(v.as_str(), None);

        let negative = Value::from(-3i64);
        assert_eq!(negative.as_i64(), Some(-3));
        assert_eq!(negative.as_u64(), None);

        let huge = Value::from(u64::MAX);
        assert_eq!(huge.as_i64(), None);
        assert_eq!(huge.as_u64(), Some(u64::MAX));
    }

    #[test]
    fn test_map_get_finds_string_keys() {
        let event: Value = vec![("event", Value::from("BufEnter")), ("buf", Value::from(3))]
            .into_iter()
            .collect();

        assert_eq!(event.map_get("event").and_then(Value::as_str), Some("BufEnter"));
        assert_eq!(event.map_get("buf").and_then(Value::as_i64), Some(3));
        assert!(event.map_get("file").is_none());
        assert!(Value::Nil.map_get("event").is_none());
    }

    #[test]
    fn test_invalid_utf8_string_becomes_binary() {
        // fixstr of length 2 carrying invalid UTF-8
        let bytes = [0xa2u8, 0xff, 0xfe];
        let raw = rmpv::decode::read_value(&mut &bytes[..]).unwrap();
        assert_eq!(Value::from(raw), Value::Binary(vec![0xff, 0xfe]));
    }

    #[test]
    fn test_option_and_vec_conversions() {
        assert_eq!(Value::from(None::<i64>), Value::Nil);
        assert_eq!(
            Value::from(vec!["a", "b"]),
            Value::Array(vec![Value::from("a"), Value::from("b")])
        );
    }

    #[test]
    fn test_serde_bridge() {
        let mut opts = BTreeMap::new();
        opts.insert("output".to_string(), true);
        let value = to_value(&opts).unwrap();
        assert_eq!(value.map_get("output"), Some(&Value::Boolean(true)));

        let lines: Vec<String> = from_value(Value::from(vec!["one", "two"])).unwrap();
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);

        let err = from_value::<Vec<String>>(Value::from(5)).unwrap_err();
        assert!(matches!(err, RpcError::Convert(_)));
    }

    #[test]
    fn test_display_is_compact() {
        let v = Value::Array(vec![Value::from(1), Value::from("x"), Value::Nil]);
        assert_eq!(v.to_string(), r#"[1, "x", nil]"#);
    }

    #[test]
    fn test_json_conversion() {
        let v: Value = vec![("n", Value::from(2)), ("s", Value::from("ok"))]
            .into_iter()
            .collect();
        assert_eq!(v.to_json(), serde_json::json!({"n": 2, "s": "ok"}));

        let back = Value::from_json(&serde_json::json!([1, "two", null, 1.5]));
        assert_eq!(
            back,
            Value::Array(vec![
                Value::from(1),
                Value::from("two"),
                Value::Nil,
                Value::F64(1.5)
            ])
        );
    }
}
