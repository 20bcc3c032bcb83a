//! Lazy, forward-only traversal of paginated collections

use super::links::PageLinks;
use crate::error::{Error, Result};
use crate::openstack::client::ServiceClient;
use crate::openstack::result::Envelope;
use futures::stream::{self, Stream};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fmt;
use std::ops::ControlFlow;
use url::Url;

enum State {
    /// A page that has been fetched but not handed out yet
    Ready(Envelope),
    Next(Url),
    /// Surfaced on the following call, after the page that caused it
    Failed(Error),
    Done,
}

/// Walks the pages of a collection, fetching each one only when asked for.
pub struct Pager {
    client: ServiceClient,
    links: Box<dyn PageLinks>,
    items_key: Option<String>,
    state: State,
    visited: HashSet<Url>,
}

impl fmt::Debug for Pager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            State::Ready(page) => format!("Ready({})", page.url()),
            State::Next(url) => format!("Next({})", url),
            State::Failed(err) => format!("Failed({})", err),
            State::Done => "Done".to_string(),
        };
        f.debug_struct("Pager")
            .field("items_key", &self.items_key)
            .field("state", &state)
            .field("pages_fetched", &self.visited.len())
            .finish()
    }
}

impl Pager {
    /// Start from an already fetched first page
    pub fn new(client: ServiceClient, first: Envelope, links: impl PageLinks + 'static) -> Self {
        let mut visited = HashSet::new();
        visited.insert(first.url().clone());
        Self {
            client,
            links: Box::new(links),
            items_key: None,
            state: State::Ready(first),
            visited,
        }
    }

    /// Member holding the items, overriding what the link extractor says
    #[must_use]
    pub fn items_key(mut self, key: impl Into<String>) -> Self {
        self.items_key = Some(key.into());
        self
    }

    fn effective_items_key(&self) -> Option<String> {
        self.items_key
            .clone()
            .or_else(|| self.links.items_key().map(str::to_string))
    }

    /// The next page, or `None` once the collection is exhausted.
    ///
    /// After an error the pager is finished.
    pub async fn next_page(&mut self) -> Result<Option<Envelope>> {
        let page = match std::mem::replace(&mut self.state, State::Done) {
            State::Done => return Ok(None),
            State::Failed(err) => return Err(err),
            State::Ready(page) => page,
            State::Next(url) => {
                let page = self.client.get(url).await.map_err(|err| {
                    tracing::debug!("Page fetch failed, stopping pagination: {}", err);
                    err
                })?;
                self.visited.insert(page.url().clone());
                page
            }
        };

        self.state = match self.links.next_url(&page) {
            Ok(None) => State::Done,
            Ok(Some(next)) if self.visited.contains(&next) => State::Failed(Error::protocol(
                page.url().as_str(),
                format!("next page link {} points at a page already visited", next),
            )),
            Ok(Some(next)) => State::Next(next),
            Err(err) => State::Failed(err),
        };

        Ok(Some(page))
    }

    /// Call `f` on each page until it breaks or the pages run out
    pub async fn each_page<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&Envelope) -> Result<ControlFlow<()>>,
    {
        while let Some(page) = self.next_page().await? {
            if f(&page)?.is_break() {
                break;
            }
        }
        Ok(())
    }

    pub async fn all_pages(&mut self) -> Result<Vec<Envelope>> {
        let mut pages = Vec::new();
        while let Some(page) = self.next_page().await? {
            pages.push(page);
        }
        Ok(pages)
    }

    /// Items of every remaining page, in server order
    pub async fn all_items<T>(&mut self) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let key = self.effective_items_key();
        let mut items = Vec::new();
        while let Some(page) = self.next_page().await? {
            items.extend(page.extract_items::<T>(key.as_deref())?);
        }
        Ok(items)
    }

    /// Pages as a stream; dropping the stream stops fetching
    pub fn into_stream(self) -> impl Stream<Item = Result<Envelope>> + Send {
        stream::unfold(self, |mut pager| async move {
            match pager.next_page().await {
                Ok(Some(page)) => Some((Ok(page), pager)),
                Ok(None) => None,
                Err(err) => Some((Err(err), pager)),
            }
        })
    }
}
