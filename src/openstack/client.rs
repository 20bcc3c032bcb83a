//! Provider and service clients
//!
//! [`ProviderClient`] owns the HTTP connection pool and the session, and
//! executes requests: token injection, header assembly, one
//! reauthenticate-and-retry on 401/419, status classification.
//! [`ServiceClient`] binds a provider to one resolved [`Endpoint`] and adds
//! URL building and microversion headers on top.

use super::auth::{AuthOptions, AuthState, Resolver, ResolverSettings};
use super::catalog::{Endpoint, EndpointOpts};
use super::http::{sanitize_for_log, RequestOpts, AUTH_TOKEN_HEADER, GLOBAL_REQUEST_ID_HEADER};
use super::microversion::{self, MicroversionTable};
use super::query::{append_query, build_query};
use super::result::Envelope;
use crate::error::{self, Error, Result};
use crate::pagination::{PageLinks, Pager};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE, USER_AGENT};
use reqwest::redirect::Policy;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub const DEFAULT_USER_AGENT: &str = concat!("stackcore/", env!("CARGO_PKG_VERSION"));

/// Non-standard status some services use for an expired token
const AUTHENTICATION_TIMEOUT: u16 = 419;

/// Generate a global request id in the `req-<uuid>` form services expect
pub fn new_request_id() -> String {
    format!("req-{}", uuid::Uuid::new_v4())
}

/// Options for building a [`ProviderClient`]
#[derive(Debug, Clone)]
pub struct ProviderClientBuilder {
    user_agent_prefix: Option<String>,
    timeout: Option<Duration>,
    follow_redirects: bool,
    global_request_id: Option<String>,
    settings: ResolverSettings,
}

impl Default for ProviderClientBuilder {
    fn default() -> Self {
        Self {
            user_agent_prefix: None,
            timeout: None,
            follow_redirects: true,
            global_request_id: None,
            settings: ResolverSettings::default(),
        }
    }
}

impl ProviderClientBuilder {
    /// Prepended to the default user agent, e.g. `my-tool/1.0`
    #[must_use]
    pub fn user_agent_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.user_agent_prefix = Some(prefix.into());
        self
    }

    /// Per-request transport timeout
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    /// Sent as `X-OpenStack-Request-ID` on every request
    #[must_use]
    pub fn global_request_id(mut self, id: impl Into<String>) -> Self {
        self.global_request_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn microversions(mut self, table: MicroversionTable) -> Self {
        self.settings.microversions = table;
        self
    }

    #[must_use]
    pub fn expiry_margin(mut self, margin: Duration) -> Self {
        self.settings.expiry_margin = margin;
        self
    }

    fn http_client(&self) -> Result<Client> {
        let redirect = if self.follow_redirects {
            Policy::limited(10)
        } else {
            Policy::none()
        };
        let mut builder = Client::builder().redirect(redirect);
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        builder
            .build()
            .map_err(|e| Error::InvalidRequest(format!("Failed to create HTTP client: {}", e)))
    }

    fn finish(self, http: Client, resolver: Resolver) -> Result<ProviderClient> {
        let user_agent = match &self.user_agent_prefix {
            Some(prefix) => format!("{} {}", prefix, DEFAULT_USER_AGENT),
            None => DEFAULT_USER_AGENT.to_string(),
        };
        let user_agent = HeaderValue::from_str(&user_agent)
            .map_err(|_| Error::InvalidRequest(format!("invalid user agent '{}'", user_agent)))?;

        let global_request_id = self
            .global_request_id
            .as_deref()
            .map(|id| {
                HeaderValue::from_str(id)
                    .map_err(|_| Error::InvalidRequest(format!("invalid request id '{}'", id)))
            })
            .transpose()?;

        Ok(ProviderClient {
            inner: Arc::new(ProviderInner {
                http,
                resolver,
                user_agent,
                global_request_id,
            }),
        })
    }

    /// Client for a session that has not authenticated yet; the first
    /// request authenticates.
    pub fn build(self, options: AuthOptions) -> Result<ProviderClient> {
        let http = self.http_client()?;
        let resolver = Resolver::with_settings(http.clone(), options, self.settings.clone());
        self.finish(http, resolver)
    }

    /// Authenticate now, so bad credentials surface here
    pub async fn authenticate(self, options: AuthOptions) -> Result<ProviderClient> {
        let client = self.build(options)?;
        client.resolver().authenticate().await?;
        Ok(client)
    }

    /// Client around a token obtained elsewhere. It never reauthenticates.
    pub fn with_token(
        self,
        token: impl Into<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ProviderClient> {
        let http = self.http_client()?;
        self.finish(http, Resolver::with_token(token, expires_at))
    }
}

struct ProviderInner {
    http: Client,
    resolver: Resolver,
    user_agent: HeaderValue,
    global_request_id: Option<HeaderValue>,
}

/// Session-aware request executor, shared by every service client
#[derive(Clone)]
pub struct ProviderClient {
    inner: Arc<ProviderInner>,
}

impl std::fmt::Debug for ProviderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderClient")
            .field("resolver", &self.inner.resolver)
            .field("user_agent", &self.inner.user_agent)
            .finish_non_exhaustive()
    }
}

impl ProviderClient {
    pub fn builder() -> ProviderClientBuilder {
        ProviderClientBuilder::default()
    }

    /// Authenticate with default settings
    pub async fn authenticate(options: AuthOptions) -> Result<Self> {
        Self::builder().authenticate(options).await
    }

    pub fn resolver(&self) -> &Resolver {
        &self.inner.resolver
    }

    /// The current, unexpired token
    pub async fn token(&self) -> Result<Arc<AuthState>> {
        self.inner.resolver.current().await
    }

    /// Resolve an endpoint and bind a [`ServiceClient`] to it
    pub async fn service_client(&self, opts: &EndpointOpts) -> Result<ServiceClient> {
        let endpoint = self.inner.resolver.resolve_endpoint(opts).await?;
        let client = ServiceClient::new(self.clone(), endpoint);
        match &opts.microversion {
            Some(version) => client.with_microversion(version.clone()),
            None => Ok(client),
        }
    }

    /// Execute one request against an absolute URL.
    ///
    /// A provider has no endpoint to check a microversion against, so
    /// `opts.microversion` is rejected here; go through a [`ServiceClient`].
    pub async fn request(&self, url: Url, opts: &RequestOpts) -> Result<Envelope> {
        if let Some(version) = &opts.microversion {
            return Err(Error::UnsupportedMicroversion {
                service_type: "(none)".to_string(),
                requested: version.clone(),
                supported: "none: requests without a service endpoint take no microversion"
                    .to_string(),
            });
        }
        let expected = opts.expected_codes();
        let body = opts.encode_body()?;

        let state = self.inner.resolver.current().await?;
        let (mut status, mut headers, mut bytes) =
            self.send(&url, opts, body.clone(), &state.token).await?;

        let rejected = status == StatusCode::UNAUTHORIZED || status.as_u16() == AUTHENTICATION_TIMEOUT;
        if rejected
            && !expected.contains(&status)
            && opts.reauth
            && self.inner.resolver.can_reauthenticate()
        {
            tracing::debug!("{} {} returned {}, reauthenticating", opts.method, url, status);
            let fresh = self.inner.resolver.reauthenticate_after(state.generation).await?;
            (status, headers, bytes) = self.send(&url, opts, body, &fresh.token).await?;
        }

        if !expected.contains(&status) {
            tracing::warn!(
                "API error: {} {} - {} - {}",
                opts.method,
                url,
                status,
                sanitize_for_log(&String::from_utf8_lossy(&bytes))
            );
            return Err(error::classify(&opts.method, url.as_str(), status, &headers, bytes, &expected).into());
        }

        Ok(Envelope::new(opts.method.clone(), url, status, headers, bytes))
    }

    async fn send(
        &self,
        url: &Url,
        opts: &RequestOpts,
        body: Option<(Bytes, HeaderValue)>,
        token: &str,
    ) -> Result<(StatusCode, HeaderMap, Bytes)> {
        let (data, content_type) = match body {
            Some((data, content_type)) => (Some(data), Some(content_type)),
            None => (None, None),
        };
        let headers = self.request_headers(opts, content_type, token)?;

        tracing::debug!("{} {}", opts.method, url);

        let mut request = self
            .inner
            .http
            .request(opts.method.clone(), url.clone())
            .headers(headers);
        if let Some(data) = data {
            request = request.body(data);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::unreachable(url.as_str(), e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::unreachable(url.as_str(), e))?;

        Ok((status, headers, bytes))
    }

    /// Defaults, then caller overrides, then omissions
    fn request_headers(
        &self,
        opts: &RequestOpts,
        content_type: Option<HeaderValue>,
        token: &str,
    ) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, self.inner.user_agent.clone());
        if let Some(content_type) = content_type {
            headers.insert(CONTENT_TYPE, content_type);
        }

        let mut token = HeaderValue::from_str(token)
            .map_err(|_| Error::InvalidRequest("token is not a valid header value".to_string()))?;
        token.set_sensitive(true);
        headers.insert(HeaderName::from_static(AUTH_TOKEN_HEADER), token);

        if let Some(id) = &self.inner.global_request_id {
            headers.insert(HeaderName::from_static(GLOBAL_REQUEST_ID_HEADER), id.clone());
        }

        for name in opts.headers.keys() {
            headers.remove(name);
        }
        for (name, value) in &opts.headers {
            headers.append(name.clone(), value.clone());
        }

        for name in &opts.omit_headers {
            headers.remove(name);
        }
        Ok(headers)
    }
}

/// A provider bound to one service endpoint
#[derive(Debug, Clone)]
pub struct ServiceClient {
    provider: ProviderClient,
    endpoint: Endpoint,
    /// Some services serve resources below a versioned path of the endpoint
    resource_base: Option<Url>,
    microversion: Option<String>,
    more_headers: HeaderMap,
}

impl ServiceClient {
    pub fn new(provider: ProviderClient, endpoint: Endpoint) -> Self {
        Self {
            provider,
            endpoint,
            resource_base: None,
            microversion: None,
            more_headers: HeaderMap::new(),
        }
    }

    pub fn provider(&self) -> &ProviderClient {
        &self.provider
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn microversion(&self) -> Option<&str> {
        self.microversion.as_deref()
    }

    /// Serve resources from `path` below the endpoint, e.g. `v2.0/`
    pub fn with_resource_base(mut self, path: &str) -> Result<Self> {
        let joined = self
            .endpoint
            .url
            .join(path.trim_start_matches('/'))
            .map_err(|e| Error::InvalidRequest(format!("invalid resource base '{}': {}", path, e)))?;
        let base = super::catalog::normalize_url(joined.as_str())
            .map_err(|e| Error::InvalidRequest(format!("invalid resource base '{}': {}", path, e)))?;
        self.resource_base = Some(base);
        Ok(self)
    }

    /// Request `version` on every call; checked against the endpoint's range
    pub fn with_microversion(mut self, version: impl Into<String>) -> Result<Self> {
        let version = version.into();
        self.endpoint.check_microversion(&version)?;
        self.microversion = Some(version);
        Ok(self)
    }

    /// Extra header sent on every call, unless the request overrides it
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.more_headers.insert(name, value);
        self
    }

    pub fn base_url(&self) -> &Url {
        self.resource_base.as_ref().unwrap_or(&self.endpoint.url)
    }

    /// `{base}/seg1/seg2/...`, percent-encoding each segment
    pub fn service_url(&self, segments: &[&str]) -> Result<Url> {
        let path = segments
            .iter()
            .map(|segment| urlencoding::encode(segment))
            .collect::<Vec<_>>()
            .join("/");
        self.url(&path)
    }

    /// `{base}/{path}` for an already-encoded relative path (may carry a query)
    pub fn url(&self, path: &str) -> Result<Url> {
        self.base_url()
            .join(path.trim_start_matches('/'))
            .map_err(|e| Error::InvalidRequest(format!("invalid path '{}': {}", path, e)))
    }

    /// Execute `opts` with this service's headers and microversion
    pub async fn request(&self, url: Url, mut opts: RequestOpts) -> Result<Envelope> {
        let version = opts.microversion.take().or_else(|| self.microversion.clone());
        if let Some(version) = version {
            self.endpoint.check_microversion(&version)?;
            for (name, value) in microversion::headers(&self.endpoint.service_type, &version)? {
                if !opts.headers.contains_key(&name) {
                    opts.headers.insert(name, value);
                }
            }
        }

        for (name, value) in &self.more_headers {
            if !opts.headers.contains_key(name) {
                opts.headers.insert(name.clone(), value.clone());
            }
        }

        self.provider.request(url, &opts).await
    }

    pub async fn get(&self, url: Url) -> Result<Envelope> {
        self.request(url, RequestOpts::get()).await
    }

    pub async fn post(&self, url: Url, body: Value) -> Result<Envelope> {
        self.request(url, RequestOpts::post().json(body)).await
    }

    pub async fn put(&self, url: Url, body: Value) -> Result<Envelope> {
        self.request(url, RequestOpts::put().json(body)).await
    }

    pub async fn patch(&self, url: Url, body: Value) -> Result<Envelope> {
        self.request(url, RequestOpts::patch().json(body)).await
    }

    pub async fn delete(&self, url: Url) -> Result<Envelope> {
        self.request(url, RequestOpts::delete()).await
    }

    pub async fn head(&self, url: Url) -> Result<Envelope> {
        self.request(url, RequestOpts::head()).await
    }

    /// Fetch the first page of a collection and return a pager over it.
    /// `query` is any option struct; pass `&()` for none.
    pub async fn list<Q, L>(&self, mut url: Url, query: &Q, links: L) -> Result<Pager>
    where
        Q: Serialize + ?Sized,
        L: PageLinks + 'static,
    {
        append_query(&mut url, &build_query(query)?);
        let first = self.get(url).await?;
        Ok(Pager::new(self.clone(), first, links))
    }
}
