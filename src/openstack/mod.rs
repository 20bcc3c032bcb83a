//! OpenStack API interaction module
//!
//! This module provides the shared machinery every resource call depends on:
//! authentication and endpoint discovery, request execution, and response
//! decoding.
//!
//! # Module Structure
//!
//! - [`auth`] - identity v3 authentication and the session [`Resolver`](auth::Resolver)
//! - [`catalog`] - service catalog and endpoint resolution
//! - [`client`] - provider and service clients that execute requests
//! - [`http`] - request descriptors and default status codes
//! - [`body`] - request bodies with selective omission of unset fields
//! - [`query`] - query strings from option structs
//! - [`microversion`] - microversion ranges and headers
//! - [`result`] - the response [`Envelope`](result::Envelope)
//!
//! # Example
//!
//! ```ignore
//! use stackcore::openstack::{AuthOptions, EndpointOpts, ProviderClient};
//!
//! async fn example(options: AuthOptions) -> stackcore::Result<()> {
//!     let provider = ProviderClient::authenticate(options).await?;
//!     let magnum = provider
//!         .service_client(&EndpointOpts::new("container-infra").region("RegionOne"))
//!         .await?;
//!     let page = magnum.get(magnum.service_url(&["clusters"])?).await?;
//!     let clusters: Vec<serde_json::Value> = page.extract_items(Some("clusters"))?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod body;
pub mod catalog;
pub mod client;
pub mod http;
pub mod microversion;
pub mod query;
pub mod result;

pub use auth::{AuthOptions, AuthState, Resolver, ResolverSettings};
pub use body::Field;
pub use catalog::{Catalog, Endpoint, EndpointOpts, Interface};
pub use client::{ProviderClient, ProviderClientBuilder, ServiceClient};
pub use http::{RequestBody, RequestOpts};
pub use microversion::{Microversion, MicroversionRange, MicroversionTable};
pub use result::Envelope;
