//! Query string construction for list/filter options
//!
//! Follows the same omission rule as request bodies: a `null`/unset field
//! contributes nothing, an explicit `false`, `0`, or `""` is sent.

use crate::error::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use url::Url;

/// Flatten `opts` into ordered query pairs. Arrays become repeated keys.
pub fn build_query<T: Serialize + ?Sized>(opts: &T) -> Result<Vec<(String, String)>> {
    let value = serde_json::to_value(opts)
        .map_err(|e| Error::InvalidRequest(format!("query options are not serializable: {}", e)))?;

    let map = match value {
        Value::Null => return Ok(Vec::new()),
        Value::Object(map) => map,
        _ => {
            return Err(Error::InvalidRequest(
                "query options must serialize to a JSON object".to_string(),
            ))
        }
    };

    let mut pairs = Vec::with_capacity(map.len());
    for (key, value) in map {
        match value {
            Value::Null => {}
            Value::Array(items) => {
                for item in items {
                    if let Some(s) = scalar_to_string(&key, item)? {
                        pairs.push((key.clone(), s));
                    }
                }
            }
            other => {
                if let Some(s) = scalar_to_string(&key, other)? {
                    pairs.push((key, s));
                }
            }
        }
    }
    Ok(pairs)
}

/// Append pairs to `url`, keeping any query it already has
pub fn append_query(url: &mut Url, pairs: &[(String, String)]) {
    if pairs.is_empty() {
        return;
    }
    url.query_pairs_mut()
        .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
}

/// Replace (or add) a single query parameter, dropping earlier occurrences
pub fn set_query_param(url: &mut Url, key: &str, value: &str) {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != key)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    url.set_query(None);
    let mut query = url.query_pairs_mut();
    for (k, v) in &kept {
        query.append_pair(k, v);
    }
    query.append_pair(key, value);
}

fn scalar_to_string(key: &str, value: Value) -> Result<Option<String>> {
    match value {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(b.to_string())),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::String(s) => Ok(Some(s)),
        Value::Array(_) | Value::Object(_) => Err(Error::InvalidRequest(format!(
            "query parameter '{}' must be a scalar or a list of scalars",
            key
        ))),
    }
}
