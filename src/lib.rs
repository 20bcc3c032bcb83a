//! Client core for OpenStack-style cloud control planes
//!
//! Resolves service endpoints from the identity catalog, keeps the auth
//! token fresh, executes requests, decodes responses, follows pagination,
//! and classifies failures.

pub mod config;
pub mod error;
pub mod openstack;
pub mod pagination;

pub use error::{ApiError, Error, ErrorKind, Result};
