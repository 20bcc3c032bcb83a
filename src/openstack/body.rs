//! Request body construction with selective omission
//!
//! OpenStack services treat "field absent" and "field set to false/0/empty"
//! differently, so option structs must be able to express both. [`Field`] is
//! the tri-state used for that: `Unset` never reaches the wire, `Set(v)` is
//! always sent, whatever `v` is.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// An optional request field that distinguishes "not set" from any value.
///
/// Use with `#[serde(default, skip_serializing_if = "Field::is_unset")]`.
/// `Null` serializes to JSON `null`; it only survives to the wire when the
/// request turns off `omit_unset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field<T> {
    Unset,
    Null,
    Set(T),
}

impl<T> Field<T> {
    pub fn is_unset(&self) -> bool {
        matches!(self, Field::Unset)
    }

    pub fn is_set(&self) -> bool {
        matches!(self, Field::Set(_))
    }

    pub fn as_option(&self) -> Option<&T> {
        match self {
            Field::Set(v) => Some(v),
            _ => None,
        }
    }

    /// `None` maps to `Unset`
    pub fn from_option(value: Option<T>) -> Self {
        match value {
            Some(v) => Field::Set(v),
            None => Field::Unset,
        }
    }
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Field::Unset
    }
}

impl<T> From<T> for Field<T> {
    fn from(value: T) -> Self {
        Field::Set(value)
    }
}

impl<T: Serialize> Serialize for Field<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Field::Set(v) => v.serialize(serializer),
            Field::Unset | Field::Null => serializer.serialize_none(),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Field<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(match Option::<T>::deserialize(deserializer)? {
            Some(v) => Field::Set(v),
            None => Field::Null,
        })
    }
}

/// Serialize option struct `opts`, optionally wrapped under `parent`
/// (`{"nodegroup": {...}}`). Unset fields are dropped by the struct's serde
/// attributes; remaining `null` members are dropped by [`prune_unset`] when
/// the request is executed.
pub fn build_request_body<T: Serialize + ?Sized>(opts: &T, parent: Option<&str>) -> Result<Value> {
    let value = serde_json::to_value(opts)
        .map_err(|e| Error::InvalidRequest(format!("request body is not serializable: {}", e)))?;

    if !value.is_object() {
        return Err(Error::InvalidRequest(format!(
            "request body must be a JSON object, got {}",
            json_type_name(&value)
        )));
    }

    Ok(match parent {
        Some(key) => {
            let mut wrapper = Map::with_capacity(1);
            wrapper.insert(key.to_string(), value);
            Value::Object(wrapper)
        }
        None => value,
    })
}

/// Drop `null` object members, recursively. Array elements are positional
/// and are left alone, apart from recursing into them.
pub fn prune_unset(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|_, v| !v.is_null());
            map.values_mut().for_each(prune_unset);
        }
        Value::Array(items) => items.iter_mut().for_each(prune_unset),
        _ => {}
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
