//! Next-page link extraction
//!
//! Services disagree on how they point at the next page, so the [`Pager`]
//! takes a [`PageLinks`] implementation per resource.
//!
//! [`Pager`]: super::Pager

use crate::error::{Error, Result};
use crate::openstack::query::set_query_param;
use crate::openstack::result::Envelope;
use reqwest::header::LINK;
use serde_json::Value;
use url::Url;

/// Finds the URL of the page after `page`
pub trait PageLinks: Send + Sync {
    /// `None` when `page` is the last one
    fn next_url(&self, page: &Envelope) -> Result<Option<Url>>;

    /// Member holding the items; `None` lets the envelope pick the single array
    fn items_key(&self) -> Option<&str> {
        None
    }
}

impl<F> PageLinks for F
where
    F: Fn(&Envelope) -> Result<Option<Url>> + Send + Sync,
{
    fn next_url(&self, page: &Envelope) -> Result<Option<Url>> {
        self(page)
    }
}

/// Resolve a link found in `page` against the page's own URL
fn resolve(page: &Envelope, raw: &str) -> Result<Url> {
    page.url()
        .join(raw.trim())
        .map_err(|e| Error::protocol(page.url().as_str(), format!("invalid next link '{}': {}", raw, e)))
}

/// Link in the body, at a JSON path (`["next"]` by default).
///
/// The value may be a URL string or a list of `{"rel": ..., "href": ...}`
/// objects, in which case the one with `rel == "next"` is used.
#[derive(Debug, Clone)]
pub struct BodyLink {
    path: Vec<String>,
    items_key: Option<String>,
}

impl Default for BodyLink {
    fn default() -> Self {
        Self::at(["next"])
    }
}

impl BodyLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            path: path.into_iter().map(Into::into).collect(),
            items_key: None,
        }
    }

    /// `{"servers": [...], "servers_links": [{"rel": "next", ...}]}`
    pub fn links_member(items_key: &str) -> Self {
        Self::at([format!("{}_links", items_key)]).with_items_key(items_key)
    }

    #[must_use]
    pub fn with_items_key(mut self, key: impl Into<String>) -> Self {
        self.items_key = Some(key.into());
        self
    }
}

impl PageLinks for BodyLink {
    fn next_url(&self, page: &Envelope) -> Result<Option<Url>> {
        let mut value = page.json()?;
        for segment in &self.path {
            match value.get(segment) {
                Some(inner) => value = inner,
                None => return Ok(None),
            }
        }

        match value {
            Value::String(s) if s.trim().is_empty() => Ok(None),
            Value::String(s) => resolve(page, s).map(Some),
            Value::Array(links) => links
                .iter()
                .find(|link| link.get("rel").and_then(Value::as_str) == Some("next"))
                .and_then(|link| link.get("href").and_then(Value::as_str))
                .map(|href| resolve(page, href))
                .transpose(),
            Value::Null => Ok(None),
            other => Err(Error::protocol(
                page.url().as_str(),
                format!("next link at '{}' is neither a string nor a list: {}", self.path.join("."), other),
            )),
        }
    }

    fn items_key(&self) -> Option<&str> {
        self.items_key.as_deref()
    }
}

/// Marker pagination: the next page is the current URL with `marker` set to
/// the last item's id. An empty page ends the sequence.
#[derive(Debug, Clone)]
pub struct MarkerLink {
    items_key: Option<String>,
    marker_field: String,
    param: String,
}

impl MarkerLink {
    /// Items under `items_key` (or the single array member), marker from `id`
    pub fn new(items_key: Option<&str>) -> Self {
        Self {
            items_key: items_key.map(str::to_string),
            marker_field: "id".to_string(),
            param: "marker".to_string(),
        }
    }

    #[must_use]
    pub fn marker_field(mut self, field: impl Into<String>) -> Self {
        self.marker_field = field.into();
        self
    }

    #[must_use]
    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.param = name.into();
        self
    }
}

impl PageLinks for MarkerLink {
    fn next_url(&self, page: &Envelope) -> Result<Option<Url>> {
        let Some(last) = page.item_values(self.items_key.as_deref())?.last() else {
            return Ok(None);
        };

        let marker = match last.get(&self.marker_field) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(Error::protocol(
                    page.url().as_str(),
                    format!("last item has no '{}' to use as a marker", self.marker_field),
                ))
            }
        };

        let mut next = page.url().clone();
        set_query_param(&mut next, &self.param, &marker);
        Ok(Some(next))
    }

    fn items_key(&self) -> Option<&str> {
        self.items_key.as_deref()
    }
}

/// RFC 8288 `Link: <url>; rel="next"` response header
#[derive(Debug, Clone, Default)]
pub struct HeaderLink {
    items_key: Option<String>,
}

impl HeaderLink {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_items_key(mut self, key: impl Into<String>) -> Self {
        self.items_key = Some(key.into());
        self
    }
}

/// Split a `Link` header value on the commas between entries. Commas inside
/// `<...>` belong to the URL.
fn link_entries(value: &str) -> Vec<&str> {
    let mut entries = Vec::new();
    let mut in_target = false;
    let mut start = 0;
    for (i, c) in value.char_indices() {
        match c {
            '<' => in_target = true,
            '>' => in_target = false,
            ',' if !in_target => {
                entries.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    entries.push(&value[start..]);
    entries
}

/// Target of the `rel="next"` entry of one or more `Link` header values
fn next_from_link_header<'a>(values: impl Iterator<Item = &'a str>) -> Option<&'a str> {
    values.flat_map(link_entries).find_map(|entry| {
        let entry = entry.trim().strip_prefix('<')?;
        let (target, params) = entry.split_once('>')?;
        let is_next = params.split(';').any(|param| {
            param
                .trim()
                .strip_prefix("rel=")
                .map(|rel| rel.trim_matches('"').split_whitespace().any(|r| r.eq_ignore_ascii_case("next")))
                .unwrap_or(false)
        });
        is_next.then_some(target)
    })
}

impl PageLinks for HeaderLink {
    fn next_url(&self, page: &Envelope) -> Result<Option<Url>> {
        let values = page.headers().get_all(LINK).iter().filter_map(|v| v.to_str().ok());
        next_from_link_header(values).map(|raw| resolve(page, raw)).transpose()
    }

    fn items_key(&self) -> Option<&str> {
        self.items_key.as_deref()
    }
}

/// Unpaginated collections
#[derive(Debug, Clone, Default)]
pub struct SinglePage {
    items_key: Option<String>,
}

impl SinglePage {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_items_key(mut self, key: impl Into<String>) -> Self {
        self.items_key = Some(key.into());
        self
    }
}

impl PageLinks for SinglePage {
    fn next_url(&self, _page: &Envelope) -> Result<Option<Url>> {
        Ok(None)
    }

    fn items_key(&self) -> Option<&str> {
        self.items_key.as_deref()
    }
}
