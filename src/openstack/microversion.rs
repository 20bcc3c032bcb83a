//! API microversions
//!
//! Which microversions a service accepts is deployment configuration, so the
//! supported ranges live in a [`MicroversionTable`] handed to the resolver
//! rather than being baked in per service.

use crate::error::{Error, Result};
use reqwest::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// The literal some services accept for "newest supported"
pub const LATEST: &str = "latest";

/// A `major.minor` API microversion
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Microversion {
    pub major: u32,
    pub minor: u32,
}

impl Microversion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl FromStr for Microversion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidRequest(format!("invalid microversion '{}'", s));
        let (major, minor) = s.trim().split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

impl TryFrom<String> for Microversion {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Microversion> for String {
    fn from(value: Microversion) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Microversion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Inclusive range of microversions a service accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MicroversionRange {
    pub min: Microversion,
    pub max: Microversion,
}

impl MicroversionRange {
    pub fn new(min: Microversion, max: Microversion) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, version: Microversion) -> bool {
        self.min <= version && version <= self.max
    }
}

impl fmt::Display for MicroversionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

/// Supported microversion range per service type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MicroversionTable {
    ranges: HashMap<String, MicroversionRange>,
}

impl MicroversionTable {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, service_type: impl Into<String>, range: MicroversionRange) -> Self {
        self.insert(service_type, range);
        self
    }

    pub fn insert(&mut self, service_type: impl Into<String>, range: MicroversionRange) {
        self.ranges.insert(service_type.into(), range);
    }

    pub fn get(&self, service_type: &str) -> Option<MicroversionRange> {
        self.ranges.get(service_type).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Check `requested` against what the service declared.
///
/// A service with no declared range accepts no microversion at all.
pub fn check_supported(
    service_type: &str,
    requested: &str,
    range: Option<MicroversionRange>,
) -> Result<()> {
    let unsupported = |supported: String| Error::UnsupportedMicroversion {
        service_type: service_type.to_string(),
        requested: requested.to_string(),
        supported,
    };

    let Some(range) = range else {
        return Err(unsupported("none".to_string()));
    };

    if requested == LATEST {
        return Ok(());
    }

    let version: Microversion = requested.parse()?;
    if range.contains(version) {
        Ok(())
    } else {
        Err(unsupported(range.to_string()))
    }
}

/// Legacy per-service header some services still expect alongside the generic one
fn legacy_header(service_type: &str) -> Option<&'static str> {
    match service_type {
        "compute" => Some("X-OpenStack-Nova-API-Version"),
        "sharev2" => Some("X-OpenStack-Manila-API-Version"),
        "volume" | "volumev3" | "block-storage" => Some("X-OpenStack-Volume-API-Version"),
        "baremetal" => Some("X-OpenStack-Ironic-API-Version"),
        "baremetal-introspection" => Some("X-OpenStack-Ironic-Inspector-API-Version"),
        _ => None,
    }
}

/// Headers that request `version` from a service of `service_type`
pub fn headers(service_type: &str, version: &str) -> Result<Vec<(HeaderName, HeaderValue)>> {
    let value = |v: String| {
        HeaderValue::from_str(&v)
            .map_err(|_| Error::InvalidRequest(format!("invalid microversion header value '{}'", v)))
    };

    // OpenStack-API-Version: <service-type> <version>
    let mut headers = vec![(
        HeaderName::from_static("openstack-api-version"),
        value(format!("{} {}", service_type, version))?,
    )];

    if let Some(name) = legacy_header(service_type) {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::InvalidRequest(e.to_string()))?;
        headers.push((name, value(version.to_string())?));
    }

    Ok(headers)
}
