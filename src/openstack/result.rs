//! Response envelope with memoized decoding
//!
//! An [`Envelope`] keeps everything a response carried (status, headers, raw
//! bytes) and decodes lazily. The body is parsed into a `serde_json::Value`
//! at most once, and each typed view (`extract_into::<T>`, per key) at most
//! once per type.

use crate::error::{self, Error, Result};
use bytes::Bytes;
use reqwest::header::{HeaderMap, LOCATION};
use reqwest::{Method, StatusCode};
use serde::de::{DeserializeOwned, Error as _};
use serde_json::Value;
use std::any::{Any, TypeId};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum View {
    Whole,
    Key(String),
    Items(Option<String>),
}

type DecodeCache = HashMap<(TypeId, View), Arc<dyn Any + Send + Sync>>;

/// A successful response
pub struct Envelope {
    method: Method,
    url: Url,
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    parsed: OnceLock<std::result::Result<Value, Arc<serde_json::Error>>>,
    decoded: Mutex<DecodeCache>,
}

impl Envelope {
    pub fn new(method: Method, url: Url, status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            method,
            url,
            status,
            headers,
            body,
            parsed: OnceLock::new(),
            decoded: Mutex::new(HashMap::new()),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The URL that produced this response
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// A header value, if present and valid UTF-8. Names are case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn request_id(&self) -> Option<String> {
        error::request_id(&self.headers)
    }

    /// `Location`, resolved against the request URL
    pub fn location(&self) -> Option<Url> {
        let raw = self.headers.get(LOCATION)?.to_str().ok()?;
        self.url.join(raw).ok()
    }

    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn is_empty(&self) -> bool {
        self.body.iter().all(u8::is_ascii_whitespace)
    }

    /// The body as JSON. An empty body is `null`.
    pub fn json(&self) -> Result<&Value> {
        let parsed = self.parsed.get_or_init(|| {
            if self.is_empty() {
                Ok(Value::Null)
            } else {
                serde_json::from_slice(&self.body).map_err(Arc::new)
            }
        });
        parsed.as_ref().map_err(|source| Error::Decode {
            target: "serde_json::Value",
            source: Arc::clone(source),
        })
    }

    /// Decode the whole body into `T`
    pub fn extract_into<T>(&self) -> Result<T>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.memoized(View::Whole, || self.decode(self.json()?))
    }

    /// Decode the member under a top-level wrapping key, e.g. `{"nodegroup": {...}}`.
    ///
    /// A missing key decodes as `null`, so `Option<T>` yields `None`.
    pub fn extract_key<T>(&self, label: &str) -> Result<T>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.memoized(View::Key(label.to_string()), || {
            let value = self.json()?;
            match value.get(label) {
                Some(inner) => T::deserialize(inner).map_err(Error::decode::<T>),
                None => T::deserialize(&Value::Null).map_err(|_| {
                    Error::decode::<T>(serde_json::Error::custom(format!(
                        "response has no top-level `{}` member",
                        label
                    )))
                }),
            }
        })
    }

    /// Decode a list of items. `key` names the array member; with `None` the
    /// body itself, or its single array-valued member, is used.
    pub fn extract_items<T>(&self, key: Option<&str>) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.memoized(View::Items(key.map(str::to_string)), || {
            self.item_values(key)?
                .iter()
                .map(|item| T::deserialize(item).map_err(Error::decode::<T>))
                .collect()
        })
    }

    /// The raw item array, see [`Envelope::extract_items`]. Link members
    /// (`links`, `*_links`) are never taken for the items.
    pub fn item_values(&self, key: Option<&str>) -> Result<&[Value]> {
        let value = self.json()?;
        let not_a_list = |detail: String| {
            Error::decode::<Vec<Value>>(serde_json::Error::custom(detail))
        };

        if let Some(key) = key {
            return match value.get(key) {
                Some(Value::Array(items)) => Ok(items.as_slice()),
                Some(Value::Null) => Ok(&[]),
                Some(_) => Err(not_a_list(format!("`{}` is not an array", key))),
                None if value.is_null() => Ok(&[]),
                None => Err(not_a_list(format!("response has no `{}` member", key))),
            };
        }

        match value {
            Value::Null => Ok(&[]),
            Value::Array(items) => Ok(items.as_slice()),
            Value::Object(map) => {
                let mut arrays = map
                    .iter()
                    .filter(|(k, _)| *k != "links" && !k.ends_with("_links"))
                    .filter_map(|(k, v)| v.as_array().map(|items| (k, items)));
                match (arrays.next(), arrays.next()) {
                    (Some((_, items)), None) => Ok(items.as_slice()),
                    (None, _) => Err(not_a_list("response has no array member".to_string())),
                    (Some((first, _)), Some((second, _))) => Err(not_a_list(format!(
                        "response has several array members (`{}`, `{}`), name one",
                        first, second
                    ))),
                }
            }
            _ => Err(not_a_list("response is neither an object nor an array".to_string())),
        }
    }

    fn decode<T: DeserializeOwned>(&self, value: &Value) -> Result<T> {
        match T::deserialize(value) {
            Ok(v) => Ok(v),
            Err(err) if value.is_null() && self.is_empty() => {
                // 202/204 with no body: accept whichever empty shape T takes
                [Value::Object(Default::default()), Value::Array(Vec::new())]
                    .iter()
                    .find_map(|fallback| T::deserialize(fallback).ok())
                    .ok_or_else(|| Error::decode::<T>(err))
            }
            Err(err) => Err(Error::decode::<T>(err)),
        }
    }

    fn memoized<T>(&self, view: View, decode: impl FnOnce() -> Result<T>) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let key = (TypeId::of::<T>(), view);
        if let Some(hit) = self.cache().get(&key).and_then(|v| v.downcast_ref::<T>()) {
            return Ok(hit.clone());
        }

        let value = decode()?;
        self.cache().insert(key, Arc::new(value.clone()));
        Ok(value)
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, DecodeCache> {
        self.decoded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn cached_views(&self) -> usize {
        self.cache().len()
    }
}

impl Clone for Envelope {
    fn clone(&self) -> Self {
        Self {
            method: self.method.clone(),
            url: self.url.clone(),
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone(),
            parsed: self.parsed.clone(),
            decoded: Mutex::new(self.cache().clone()),
        }
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("status", &self.status)
            .field("request_id", &self.request_id())
            .field("body_len", &self.body.len())
            .finish()
    }
}
