//! Pagination
//!
//! - [`pager`] - the [`Pager`] itself
//! - [`links`] - next-page extractors (`BodyLink`, `MarkerLink`, `HeaderLink`, `SinglePage`)

pub mod links;
pub mod pager;

pub use links::{BodyLink, HeaderLink, MarkerLink, PageLinks, SinglePage};
pub use pager::Pager;
