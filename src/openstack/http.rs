//! Request descriptors and HTTP helpers shared by the clients

use super::body::{build_request_body, prune_unset};
use crate::error::{Error, Result};
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde_json::Value;

/// Maximum length of response body to log (to avoid logging sensitive data)
const MAX_LOG_BODY_LENGTH: usize = 200;

pub const AUTH_TOKEN_HEADER: &str = "x-auth-token";

/// Header carrying a caller-chosen request id that services propagate
pub const GLOBAL_REQUEST_ID_HEADER: &str = "x-openstack-request-id";

/// Sanitize response body for logging
/// Truncates long responses and drops control characters
pub fn sanitize_for_log(body: &str) -> String {
    let truncated = if body.len() > MAX_LOG_BODY_LENGTH {
        let mut end = MAX_LOG_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... [truncated, {} bytes total]", &body[..end], body.len())
    } else {
        body.to_string()
    };

    truncated.replace(|c: char| c.is_control(), "")
}

/// Statuses accepted when a request does not name its own
pub fn default_ok_codes(method: &Method) -> &'static [StatusCode] {
    match *method {
        Method::GET => &[StatusCode::OK],
        Method::POST | Method::PUT => &[StatusCode::CREATED, StatusCode::ACCEPTED],
        Method::PATCH => &[StatusCode::OK, StatusCode::ACCEPTED, StatusCode::NO_CONTENT],
        Method::DELETE => &[StatusCode::ACCEPTED, StatusCode::NO_CONTENT],
        Method::HEAD => &[StatusCode::NO_CONTENT],
        _ => &[],
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(Value),
    Raw { content_type: String, data: Bytes },
}

/// Everything needed to issue one request, apart from the URL
#[derive(Debug, Clone)]
pub struct RequestOpts {
    pub method: Method,
    pub body: Option<RequestBody>,
    /// Empty means [`default_ok_codes`]
    pub ok_codes: Vec<StatusCode>,
    /// Applied after the defaults, so they win
    pub headers: HeaderMap,
    /// Removed last, after defaults and overrides
    pub omit_headers: Vec<HeaderName>,
    /// Drop `null` members from the JSON body before sending
    pub omit_unset: bool,
    pub microversion: Option<String>,
    /// Allow one reauthenticate-and-retry on 401/419
    pub reauth: bool,
}

impl RequestOpts {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            body: None,
            ok_codes: Vec::new(),
            headers: HeaderMap::new(),
            omit_headers: Vec::new(),
            omit_unset: true,
            microversion: None,
            reauth: true,
        }
    }

    pub fn get() -> Self {
        Self::new(Method::GET)
    }

    pub fn post() -> Self {
        Self::new(Method::POST)
    }

    pub fn put() -> Self {
        Self::new(Method::PUT)
    }

    pub fn patch() -> Self {
        Self::new(Method::PATCH)
    }

    pub fn delete() -> Self {
        Self::new(Method::DELETE)
    }

    pub fn head() -> Self {
        Self::new(Method::HEAD)
    }

    #[must_use]
    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }

    /// Serialize an option struct as the body, wrapped under `parent` if given
    pub fn json_from<T: Serialize + ?Sized>(self, opts: &T, parent: Option<&str>) -> Result<Self> {
        Ok(self.json(build_request_body(opts, parent)?))
    }

    #[must_use]
    pub fn raw(mut self, content_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.body = Some(RequestBody::Raw {
            content_type: content_type.into(),
            data: data.into(),
        });
        self
    }

    #[must_use]
    pub fn ok_codes(mut self, codes: impl IntoIterator<Item = StatusCode>) -> Self {
        self.ok_codes = codes.into_iter().collect();
        self
    }

    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn omit_header(mut self, name: HeaderName) -> Self {
        self.omit_headers.push(name);
        self
    }

    /// Send `null` members as they are
    #[must_use]
    pub fn keep_nulls(mut self) -> Self {
        self.omit_unset = false;
        self
    }

    #[must_use]
    pub fn microversion(mut self, version: impl Into<String>) -> Self {
        self.microversion = Some(version.into());
        self
    }

    #[must_use]
    pub fn no_reauth(mut self) -> Self {
        self.reauth = false;
        self
    }

    pub fn expected_codes(&self) -> Vec<StatusCode> {
        if self.ok_codes.is_empty() {
            default_ok_codes(&self.method).to_vec()
        } else {
            self.ok_codes.clone()
        }
    }

    /// Encoded body and its content type
    pub(crate) fn encode_body(&self) -> Result<Option<(Bytes, HeaderValue)>> {
        match &self.body {
            None => Ok(None),
            Some(RequestBody::Json(value)) => {
                let data = if self.omit_unset {
                    let mut pruned = value.clone();
                    prune_unset(&mut pruned);
                    serde_json::to_vec(&pruned)
                } else {
                    serde_json::to_vec(value)
                }
                .map_err(|e| Error::InvalidRequest(format!("request body is not serializable: {}", e)))?;
                Ok(Some((Bytes::from(data), HeaderValue::from_static("application/json"))))
            }
            Some(RequestBody::Raw { content_type, data }) => {
                let content_type = HeaderValue::from_str(content_type).map_err(|_| {
                    Error::InvalidRequest(format!("invalid content type '{}'", content_type))
                })?;
                Ok(Some((data.clone(), content_type)))
            }
        }
    }
}
