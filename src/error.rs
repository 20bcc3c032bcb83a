//! Error taxonomy and response classification
//!
//! Every failure the client core produces is an [`Error`]. Errors derived from
//! an HTTP status carry an [`ApiError`] with the status, the request id the
//! service assigned (if any), a human message, and the raw body, so callers can
//! both branch on [`Error::kind`] and correlate failures with server logs.

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Response headers that may carry the service-assigned request id, in lookup order
pub const REQUEST_ID_HEADERS: &[&str] = &[
    "x-openstack-request-id",
    "x-compute-request-id",
    "x-request-id",
];

/// Machine-checkable classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    Authentication,
    Unreachable,
    Protocol,
    EndpointNotFound,
    UnsupportedMicroversion,
    Decode,
    InvalidRequest,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    Timeout,
    Conflict,
    TooManyRequests,
    InternalServerError,
    NotImplemented,
    ServiceUnavailable,
    GatewayTimeout,
    /// Any other status outside the expected set, carrying the literal code
    UnexpectedStatus(u16),
}

impl ErrorKind {
    /// Map an HTTP status to its kind
    pub fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            400 => ErrorKind::BadRequest,
            401 => ErrorKind::Unauthorized,
            403 => ErrorKind::Forbidden,
            404 => ErrorKind::NotFound,
            405 => ErrorKind::MethodNotAllowed,
            408 => ErrorKind::Timeout,
            409 => ErrorKind::Conflict,
            429 => ErrorKind::TooManyRequests,
            500 => ErrorKind::InternalServerError,
            501 => ErrorKind::NotImplemented,
            503 => ErrorKind::ServiceUnavailable,
            504 => ErrorKind::GatewayTimeout,
            code => ErrorKind::UnexpectedStatus(code),
        }
    }

    /// Message used when the service sent nothing readable
    fn fallback_message(self, status: StatusCode) -> String {
        let message = match self {
            ErrorKind::BadRequest => "Bad request",
            ErrorKind::Unauthorized => "Authentication failed",
            ErrorKind::Forbidden => "Request forbidden",
            ErrorKind::NotFound => "Resource not found",
            ErrorKind::MethodNotAllowed => "Method not allowed",
            ErrorKind::Timeout => "The server timed out waiting for the request",
            ErrorKind::Conflict => "Resource conflict",
            ErrorKind::TooManyRequests => {
                "Too many requests have been sent in a given amount of time. \
                 Pause requests, wait up to one minute, and try again."
            }
            ErrorKind::InternalServerError => "Internal Server Error",
            ErrorKind::NotImplemented => "Not implemented",
            ErrorKind::ServiceUnavailable => {
                "The service is currently unable to handle the request due to a temporary \
                 overloading or maintenance. This is a temporary condition. Try again later."
            }
            ErrorKind::GatewayTimeout => "Gateway timeout",
            _ => {
                return match status.canonical_reason() {
                    Some(reason) => format!("Unexpected response code {} ({})", status.as_u16(), reason),
                    None => format!("Unexpected response code {}", status.as_u16()),
                }
            }
        };
        message.to_string()
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::UnexpectedStatus(code) => write!(f, "UnexpectedStatus({})", code),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Errors produced by the client core
///
/// `Clone` so that callers waiting on one shared reauthentication all receive
/// the same failure; transport and JSON sources are held behind `Arc`.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// Credentials were rejected, or the token can no longer be refreshed
    #[error("authentication failed: {message}")]
    Authentication {
        message: String,
        status: Option<u16>,
        request_id: Option<String>,
    },

    /// Network, DNS, TLS, or timeout failure before a response arrived
    #[error("unable to reach {url}: {source}")]
    Unreachable {
        url: String,
        #[source]
        source: Arc<reqwest::Error>,
    },

    /// A response that had to be well-formed was not
    #[error("malformed response from {url}: {message}")]
    Protocol { url: String, message: String },

    #[error("no endpoint found for service type '{service_type}' (region: '{region}', interface: '{interface}')")]
    EndpointNotFound {
        service_type: String,
        region: String,
        interface: String,
    },

    #[error("microversion {requested} is not supported by service '{service_type}' (supported: {supported})")]
    UnsupportedMicroversion {
        service_type: String,
        requested: String,
        supported: String,
    },

    /// Body is not JSON, or does not match the requested shape
    #[error("failed to decode response body into {target}: {source}")]
    Decode {
        target: &'static str,
        #[source]
        source: Arc<serde_json::Error>,
    },

    /// The request could not be built (bad URL, header, or body)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The service answered with a status outside the expected set
    #[error(transparent)]
    Api(Box<ApiError>),
}

impl Error {
    pub(crate) fn unreachable(url: impl Into<String>, source: reqwest::Error) -> Self {
        Error::Unreachable {
            url: url.into(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn decode<T: ?Sized>(source: serde_json::Error) -> Self {
        Error::Decode {
            target: std::any::type_name::<T>(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn protocol(url: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Protocol {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Authentication { .. } => ErrorKind::Authentication,
            Error::Unreachable { .. } => ErrorKind::Unreachable,
            Error::Protocol { .. } => ErrorKind::Protocol,
            Error::EndpointNotFound { .. } => ErrorKind::EndpointNotFound,
            Error::UnsupportedMicroversion { .. } => ErrorKind::UnsupportedMicroversion,
            Error::Decode { .. } => ErrorKind::Decode,
            Error::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Error::Api(api) => api.kind,
        }
    }

    /// HTTP status, when the error came from a response
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Api(api) => Some(api.status),
            Error::Authentication {
                status: Some(code), ..
            } => StatusCode::from_u16(*code).ok(),
            _ => None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            Error::Api(api) => api.request_id.as_deref(),
            Error::Authentication { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }

    pub fn api(&self) -> Option<&ApiError> {
        match self {
            Error::Api(api) => Some(api),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<ApiError> for Error {
    fn from(err: ApiError) -> Self {
        Error::Api(Box::new(err))
    }
}

/// Result type for client core operations
pub type Result<T> = std::result::Result<T, Error>;

/// A non-expected HTTP status, with whatever the service said about it
#[derive(Debug, Clone)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub status: StatusCode,
    pub method: Method,
    pub url: String,
    /// Statuses the caller would have accepted
    pub expected: Vec<u16>,
    pub request_id: Option<String>,
    /// Never empty
    pub message: String,
    /// Service-defined error name, e.g. `itemNotFound` or `NetworkNotFound`
    pub error_name: Option<String>,
    pub code: Option<String>,
    pub body: Bytes,
}

impl ApiError {
    /// Body parsed as JSON, if it is JSON
    pub fn body_json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{} {}] (status {}): {}",
            self.kind,
            self.method,
            self.url,
            self.status.as_u16(),
            self.message
        )?;
        if let Some(request_id) = &self.request_id {
            write!(f, " (request id {})", request_id)?;
        }
        Ok(())
    }
}

impl std::error::Error for ApiError {}

/// Find the service-assigned request id in response headers
pub fn request_id(headers: &HeaderMap) -> Option<String> {
    REQUEST_ID_HEADERS.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    })
}

/// Classify a response whose status the caller did not expect.
///
/// Never fails: when the body is not a recognised error payload the message
/// falls back to the body text, and for an empty body to a fixed message for
/// the status.
pub fn classify(
    method: &Method,
    url: &str,
    status: StatusCode,
    headers: &HeaderMap,
    body: Bytes,
    expected: &[StatusCode],
) -> ApiError {
    let kind = ErrorKind::from_status(status);
    let detail = ErrorDetail::from_body(&body);

    let (message, error_name, code) = match detail {
        Some(detail) => (detail.message, detail.name, detail.code),
        None => {
            let text = String::from_utf8_lossy(&body).trim().to_string();
            (text, None, None)
        }
    };

    let message = if message.is_empty() {
        kind.fallback_message(status)
    } else {
        message
    };

    ApiError {
        kind,
        status,
        method: method.clone(),
        url: url.to_string(),
        expected: expected.iter().map(StatusCode::as_u16).collect(),
        request_id: request_id(headers),
        message,
        error_name,
        code,
        body,
    }
}

/// What could be read out of a structured error payload
#[derive(Debug, PartialEq)]
struct ErrorDetail {
    message: String,
    name: Option<String>,
    code: Option<String>,
}

impl ErrorDetail {
    fn from_body(body: &[u8]) -> Option<Self> {
        let value: Value = serde_json::from_slice(body).ok()?;
        let obj = value.as_object()?;

        // {"itemNotFound": {"message": "...", "code": 404}}
        // {"NeutronError": {"type": "NetworkNotFound", "message": "..."}}
        // {"error": {"message": "...", "code": 401, "title": "Unauthorized"}}
        if obj.len() == 1 {
            if let Some((key, inner)) = obj.iter().next() {
                if let Some(message) = inner.get("message").and_then(Value::as_str) {
                    let name = inner
                        .get("type")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .or_else(|| (key != "error").then(|| key.clone()));
                    return Some(Self {
                        message: message.to_string(),
                        name,
                        code: inner.get("code").and_then(code_string),
                    });
                }
            }
        }

        // {"errors": [{"title": "...", "detail": "...", "code": "client"}]}
        if let Some(first) = obj
            .get("errors")
            .and_then(Value::as_array)
            .and_then(|errors| errors.first())
        {
            let title = first.get("title").and_then(Value::as_str).unwrap_or("");
            let detail = first.get("detail").and_then(Value::as_str).unwrap_or("");
            let message = match (title.is_empty(), detail.is_empty()) {
                (false, false) if title != detail => format!("{}: {}", title, detail),
                (false, _) => title.to_string(),
                (true, false) => detail.to_string(),
                (true, true) => String::new(),
            };
            if !message.is_empty() {
                return Some(Self {
                    message,
                    name: None,
                    code: first.get("code").and_then(code_string),
                });
            }
        }

        // {"faultstring": "...", "faultcode": "Client"}
        if let Some(fault) = obj.get("faultstring").and_then(Value::as_str) {
            return Some(Self {
                message: fault.to_string(),
                name: None,
                code: obj.get("faultcode").and_then(code_string),
            });
        }

        ["message", "error"].iter().find_map(|key| {
            obj.get(*key).and_then(Value::as_str).map(|m| Self {
                message: m.to_string(),
                name: None,
                code: obj.get("code").and_then(code_string),
            })
        })
    }
}

fn code_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
