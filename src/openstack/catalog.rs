//! Service catalog and endpoint resolution

use super::microversion::{self, MicroversionRange, MicroversionTable};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Which network-facing flavour of an endpoint to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interface {
    #[default]
    Public,
    Internal,
    Admin,
}

impl Interface {
    pub fn as_str(self) -> &'static str {
        match self {
            Interface::Public => "public",
            Interface::Internal => "internal",
            Interface::Admin => "admin",
        }
    }

    /// Accepts `public`, `Public`, and the identity v2 spelling `publicURL`
    pub fn parse_loose(raw: &str) -> Option<Self> {
        let lower = raw.trim().to_ascii_lowercase();
        match lower.strip_suffix("url").unwrap_or(&lower) {
            "public" => Some(Interface::Public),
            "internal" => Some(Interface::Internal),
            "admin" => Some(Interface::Admin),
            _ => None,
        }
    }
}

impl FromStr for Interface {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_loose(s)
            .ok_or_else(|| Error::InvalidRequest(format!("unknown endpoint interface '{}'", s)))
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One service in the catalog returned at authentication time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub endpoints: Vec<CatalogEndpoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEndpoint {
    #[serde(default)]
    pub id: String,
    pub interface: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub region_id: String,
    pub url: String,
}

impl CatalogEndpoint {
    fn in_region(&self, region: &str) -> bool {
        self.region == region || self.region_id == region
    }
}

/// Ordered list of services; order matters for tie-breaking
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
}

impl Catalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pick the endpoint for `opts`.
    ///
    /// Among matching endpoints, one whose interface string is exactly
    /// `opts.interface` wins over a loose match (`publicURL`, `Public`); after
    /// that, catalog order decides.
    pub fn resolve(&self, opts: &EndpointOpts, microversions: &MicroversionTable) -> Result<Endpoint> {
        let region = opts.region.as_deref().filter(|r| !r.is_empty());

        let candidates: Vec<(&CatalogEntry, &CatalogEndpoint)> = self
            .entries
            .iter()
            .filter(|entry| entry.service_type == opts.service_type)
            .filter(|entry| opts.name.as_deref().map_or(true, |name| entry.name == name))
            .flat_map(|entry| entry.endpoints.iter().map(move |ep| (entry, ep)))
            .filter(|(_, ep)| Interface::parse_loose(&ep.interface) == Some(opts.interface))
            .filter(|(_, ep)| region.map_or(true, |r| ep.in_region(r)))
            .collect();

        let chosen = candidates
            .iter()
            .find(|(_, ep)| ep.interface == opts.interface.as_str())
            .or_else(|| candidates.first());

        let Some((entry, ep)) = chosen else {
            return Err(Error::EndpointNotFound {
                service_type: opts.service_type.clone(),
                region: region.unwrap_or("").to_string(),
                interface: opts.interface.to_string(),
            });
        };

        let range = microversions.get(&entry.service_type);
        if let Some(requested) = &opts.microversion {
            microversion::check_supported(&entry.service_type, requested, range)?;
        }

        let url = normalize_url(&ep.url)
            .map_err(|reason| Error::protocol(&ep.url, format!("catalog URL is invalid: {}", reason)))?;

        tracing::debug!(
            "Resolved {} ({}, {}) -> {}",
            entry.service_type,
            if ep.region.is_empty() { &ep.region_id } else { &ep.region },
            opts.interface,
            url
        );

        Ok(Endpoint {
            service_type: entry.service_type.clone(),
            region: if ep.region.is_empty() {
                ep.region_id.clone()
            } else {
                ep.region.clone()
            },
            interface: opts.interface,
            url,
            microversions: range,
        })
    }
}

/// What to look for in the catalog
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointOpts {
    pub service_type: String,
    /// Service name, for catalogs with several services of one type
    pub name: Option<String>,
    /// Empty or `None` matches any region
    pub region: Option<String>,
    pub interface: Interface,
    pub microversion: Option<String>,
}

impl EndpointOpts {
    pub fn new(service_type: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            name: None,
            region: None,
            interface: Interface::default(),
            microversion: None,
        }
    }

    #[must_use]
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    #[must_use]
    pub fn interface(mut self, interface: Interface) -> Self {
        self.interface = interface;
        self
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn microversion(mut self, version: impl Into<String>) -> Self {
        self.microversion = Some(version.into());
        self
    }
}

/// A resolved service endpoint. Immutable; a catalog re-fetch builds new ones.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub service_type: String,
    pub region: String,
    pub interface: Interface,
    /// Always ends in `/`
    pub url: Url,
    /// `None` when the service takes no microversions
    pub microversions: Option<MicroversionRange>,
}

impl Endpoint {
    /// An endpoint that did not come from a catalog (static-token sessions, tests)
    pub fn new(service_type: impl Into<String>, url: &str) -> Result<Self> {
        let url = normalize_url(url)
            .map_err(|reason| Error::InvalidRequest(format!("invalid endpoint URL '{}': {}", url, reason)))?;
        Ok(Self {
            service_type: service_type.into(),
            region: String::new(),
            interface: Interface::default(),
            url,
            microversions: None,
        })
    }

    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    #[must_use]
    pub fn with_microversions(mut self, range: MicroversionRange) -> Self {
        self.microversions = Some(range);
        self
    }

    pub fn supports_microversions(&self) -> bool {
        self.microversions.is_some()
    }

    pub fn check_microversion(&self, requested: &str) -> Result<()> {
        microversion::check_supported(&self.service_type, requested, self.microversions)
    }
}

/// Parse and make sure the path ends in `/`, so relative joins append
pub fn normalize_url(raw: &str) -> std::result::Result<Url, url::ParseError> {
    let mut url = Url::parse(raw.trim())?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}
