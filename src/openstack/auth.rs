//! Identity authentication and session state
//!
//! The [`Resolver`] owns the session: the current token, its expiry, and the
//! service catalog that came with it. It hands out snapshots
//! (`Arc<AuthState>`) so in-flight requests keep a consistent token/catalog
//! pair while a refresh replaces the state underneath them.
//!
//! Refreshes are single-flight: however many requests notice an expired
//! token at once, exactly one identity call is made and every waiter gets
//! its result.

use super::body::build_request_body;
use super::catalog::{normalize_url, Catalog, CatalogEntry, Endpoint, EndpointOpts};
use super::microversion::MicroversionTable;
use crate::error::{self, Error, Result};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use url::Url;

/// Identity v3 returns the token in this header, not in the body
pub const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";

/// Credentials and scope for identity v3
#[derive(Clone, Default)]
pub struct AuthOptions {
    /// e.g. `https://keystone.example:5000/v3`
    pub identity_endpoint: String,

    pub user_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub user_domain_id: Option<String>,
    pub user_domain_name: Option<String>,

    pub project_id: Option<String>,
    pub project_name: Option<String>,
    pub project_domain_id: Option<String>,
    pub project_domain_name: Option<String>,

    /// Domain scope, used when no project is given
    pub domain_id: Option<String>,
    pub domain_name: Option<String>,

    /// Authenticate with an existing token
    pub token_id: Option<String>,

    pub application_credential_id: Option<String>,
    pub application_credential_name: Option<String>,
    pub application_credential_secret: Option<String>,

    /// Refresh the token automatically when it expires or is rejected
    pub allow_reauth: bool,
}

impl fmt::Debug for AuthOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "***");
        f.debug_struct("AuthOptions")
            .field("identity_endpoint", &self.identity_endpoint)
            .field("user_id", &self.user_id)
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("user_domain_id", &self.user_domain_id)
            .field("user_domain_name", &self.user_domain_name)
            .field("project_id", &self.project_id)
            .field("project_name", &self.project_name)
            .field("project_domain_id", &self.project_domain_id)
            .field("project_domain_name", &self.project_domain_name)
            .field("domain_id", &self.domain_id)
            .field("domain_name", &self.domain_name)
            .field("token_id", &redact(&self.token_id))
            .field("application_credential_id", &self.application_credential_id)
            .field("application_credential_name", &self.application_credential_name)
            .field(
                "application_credential_secret",
                &redact(&self.application_credential_secret),
            )
            .field("allow_reauth", &self.allow_reauth)
            .finish()
    }
}

#[derive(Serialize)]
struct AuthRequest<'a> {
    identity: Identity<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<Scope<'a>>,
}

#[derive(Serialize)]
struct Identity<'a> {
    methods: [&'static str; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<PasswordMethod<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<IdRef<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    application_credential: Option<ApplicationCredentialMethod<'a>>,
}

#[derive(Serialize)]
struct PasswordMethod<'a> {
    user: UserRef<'a>,
}

#[derive(Serialize)]
struct UserRef<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    domain: Option<NamedRef<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<&'a str>,
}

#[derive(Serialize)]
struct ApplicationCredentialMethod<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<UserRef<'a>>,
    secret: &'a str,
}

#[derive(Serialize)]
struct IdRef<'a> {
    id: &'a str,
}

/// `{"id": ...}` or `{"name": ..., "domain": {...}}`
#[derive(Serialize)]
struct NamedRef<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    domain: Option<Box<NamedRef<'a>>>,
}

#[derive(Serialize)]
#[serde(rename_all = "lowercase")]
enum Scope<'a> {
    Project(NamedRef<'a>),
    Domain(NamedRef<'a>),
}

fn domain_ref<'a>(id: &'a Option<String>, name: &'a Option<String>) -> Option<NamedRef<'a>> {
    match (id.as_deref(), name.as_deref()) {
        (Some(id), _) => Some(NamedRef {
            id: Some(id),
            name: None,
            domain: None,
        }),
        (None, Some(name)) => Some(NamedRef {
            id: None,
            name: Some(name),
            domain: None,
        }),
        (None, None) => None,
    }
}

impl AuthOptions {
    fn user_ref(&self, with_password: bool) -> Result<UserRef<'_>> {
        let password = if with_password {
            self.password.as_deref()
        } else {
            None
        };
        if let Some(id) = self.user_id.as_deref() {
            return Ok(UserRef {
                id: Some(id),
                name: None,
                domain: None,
                password,
            });
        }
        let name = self.username.as_deref().ok_or_else(|| {
            Error::InvalidRequest("either a user id or a user name is required".to_string())
        })?;
        let domain = domain_ref(&self.user_domain_id, &self.user_domain_name).ok_or_else(|| {
            Error::InvalidRequest("a user domain is required when authenticating by user name".to_string())
        })?;
        Ok(UserRef {
            id: None,
            name: Some(name),
            domain: Some(domain),
            password,
        })
    }

    fn scope(&self) -> Result<Option<Scope<'_>>> {
        if let Some(id) = self.project_id.as_deref() {
            return Ok(Some(Scope::Project(NamedRef {
                id: Some(id),
                name: None,
                domain: None,
            })));
        }
        if let Some(name) = self.project_name.as_deref() {
            let domain = domain_ref(&self.project_domain_id, &self.project_domain_name)
                .or_else(|| domain_ref(&self.user_domain_id, &self.user_domain_name))
                .ok_or_else(|| {
                    Error::InvalidRequest("a project domain is required when scoping by project name".to_string())
                })?;
            return Ok(Some(Scope::Project(NamedRef {
                id: None,
                name: Some(name),
                domain: Some(Box::new(domain)),
            })));
        }
        Ok(domain_ref(&self.domain_id, &self.domain_name).map(Scope::Domain))
    }

    /// Body for `POST /v3/auth/tokens`
    pub fn to_request_body(&self) -> Result<serde_json::Value> {
        let request = if let Some(secret) = self.application_credential_secret.as_deref() {
            // Application credentials carry their own scope
            let (id, name, user) = match self.application_credential_id.as_deref() {
                Some(id) => (Some(id), None, None),
                None => {
                    let name = self.application_credential_name.as_deref().ok_or_else(|| {
                        Error::InvalidRequest(
                            "an application credential id or name is required".to_string(),
                        )
                    })?;
                    (None, Some(name), Some(self.user_ref(false)?))
                }
            };
            AuthRequest {
                identity: Identity {
                    methods: ["application_credential"],
                    password: None,
                    token: None,
                    application_credential: Some(ApplicationCredentialMethod {
                        id,
                        name,
                        user,
                        secret,
                    }),
                },
                scope: None,
            }
        } else if self.password.is_some() {
            AuthRequest {
                identity: Identity {
                    methods: ["password"],
                    password: Some(PasswordMethod {
                        user: self.user_ref(true)?,
                    }),
                    token: None,
                    application_credential: None,
                },
                scope: self.scope()?,
            }
        } else if let Some(token) = self.token_id.as_deref() {
            AuthRequest {
                identity: Identity {
                    methods: ["token"],
                    password: None,
                    token: Some(IdRef { id: token }),
                    application_credential: None,
                },
                scope: self.scope()?,
            }
        } else {
            return Err(Error::InvalidRequest(
                "no credentials: set a password, a token, or an application credential".to_string(),
            ));
        };

        build_request_body(&request, Some("auth"))
    }

    /// A bare token cannot be exchanged again once it expires
    pub fn can_reissue(&self) -> bool {
        self.password.is_some() || self.application_credential_secret.is_some()
    }

    /// `{identity}/auth/tokens`, adding `v3/` when the endpoint is unversioned
    pub fn token_url(&self) -> Result<Url> {
        let base = normalize_url(&self.identity_endpoint).map_err(|e| {
            Error::InvalidRequest(format!(
                "invalid identity endpoint '{}': {}",
                self.identity_endpoint, e
            ))
        })?;
        let relative = if base.path().ends_with("/v3/") {
            "auth/tokens"
        } else {
            "v3/auth/tokens"
        };
        base.join(relative)
            .map_err(|e| Error::InvalidRequest(format!("invalid identity endpoint: {}", e)))
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    token: TokenBody,
}

#[derive(Deserialize)]
struct TokenBody {
    expires_at: DateTime<Utc>,
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
    #[serde(default)]
    user: Option<Ident>,
    #[serde(default)]
    project: Option<Ident>,
}

#[derive(Deserialize)]
struct Ident {
    id: String,
}

/// A snapshot of the session. Replaced wholesale on every (re)authentication.
#[derive(Clone)]
pub struct AuthState {
    pub token: String,
    /// `None` for static tokens with no known expiry
    pub expires_at: Option<DateTime<Utc>>,
    pub catalog: Catalog,
    pub user_id: Option<String>,
    pub project_id: Option<String>,
    /// Incremented on each successful authentication
    pub generation: u64,
}

impl AuthState {
    /// True once `now + margin` has reached the recorded expiry
    pub fn is_expired(&self, margin: Duration) -> bool {
        let Some(expires_at) = self.expires_at else {
            return false;
        };
        let margin = chrono::Duration::from_std(margin).unwrap_or_else(|_| chrono::Duration::zero());
        Utc::now() + margin >= expires_at
    }
}

impl fmt::Debug for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthState")
            .field("token", &"***")
            .field("expires_at", &self.expires_at)
            .field("catalog_entries", &self.catalog.entries().len())
            .field("user_id", &self.user_id)
            .field("project_id", &self.project_id)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Knobs that are not credentials
#[derive(Debug, Clone, Default)]
pub struct ResolverSettings {
    pub microversions: MicroversionTable,
    /// Treat the token as expired this long before its recorded expiry
    pub expiry_margin: Duration,
}

enum Credentials {
    Identity { http: Client, options: AuthOptions },
    Static,
}

type InflightAuth = Shared<BoxFuture<'static, Result<Arc<AuthState>>>>;

struct Inner {
    credentials: Credentials,
    settings: ResolverSettings,
    state: RwLock<Option<Arc<AuthState>>>,
    inflight: Mutex<Option<InflightAuth>>,
}

/// Session owner: token, expiry, catalog, and how to refresh them
#[derive(Clone)]
pub struct Resolver {
    inner: Arc<Inner>,
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("can_reauthenticate", &self.can_reauthenticate())
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl Resolver {
    /// A resolver that authenticates against the identity service on first use
    pub fn new(http: Client, options: AuthOptions) -> Self {
        Self::with_settings(http, options, ResolverSettings::default())
    }

    pub fn with_settings(http: Client, options: AuthOptions, settings: ResolverSettings) -> Self {
        Self::from_parts(Credentials::Identity { http, options }, settings, None)
    }

    /// A session around a token obtained elsewhere. It has no catalog and
    /// cannot be refreshed; build endpoints with [`Endpoint::new`].
    pub fn with_token(token: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        let state = AuthState {
            token: token.into(),
            expires_at,
            catalog: Catalog::default(),
            user_id: None,
            project_id: None,
            generation: 1,
        };
        Self::from_parts(Credentials::Static, ResolverSettings::default(), Some(state))
    }

    fn from_parts(credentials: Credentials, settings: ResolverSettings, state: Option<AuthState>) -> Self {
        Self {
            inner: Arc::new(Inner {
                credentials,
                settings,
                state: RwLock::new(state.map(Arc::new)),
                inflight: Mutex::new(None),
            }),
        }
    }

    pub fn microversions(&self) -> &MicroversionTable {
        &self.inner.settings.microversions
    }

    /// Whether an expired or rejected token may be replaced automatically
    pub fn can_reauthenticate(&self) -> bool {
        match &self.inner.credentials {
            Credentials::Identity { options, .. } => options.allow_reauth && options.can_reissue(),
            Credentials::Static => false,
        }
    }

    /// The current session, without checking expiry
    pub async fn state(&self) -> Option<Arc<AuthState>> {
        self.inner.state.read().await.clone()
    }

    /// Exchange the credentials for a token and catalog.
    ///
    /// Joins a refresh that is already in flight instead of starting another.
    pub async fn authenticate(&self) -> Result<Arc<AuthState>> {
        let observed = self.generation().await;
        self.refresh_after(observed).await
    }

    /// Replace the current token, honouring `allow_reauth`. Single-flight.
    pub async fn reauthenticate(&self) -> Result<Arc<AuthState>> {
        let observed = self.generation().await;
        self.reauthenticate_after(observed).await
    }

    /// Reauthenticate unless the token of generation `observed` has already
    /// been replaced, in which case the newer state is returned as is.
    pub async fn reauthenticate_after(&self, observed: u64) -> Result<Arc<AuthState>> {
        if !self.can_reauthenticate() {
            return Err(Error::Authentication {
                message: "token was rejected or expired and reauthentication is not possible"
                    .to_string(),
                status: None,
                request_id: None,
            });
        }
        self.refresh_after(observed).await
    }

    /// A token that is not past its expiry, refreshing first if needed
    pub async fn current(&self) -> Result<Arc<AuthState>> {
        let snapshot = self.state().await;
        match snapshot {
            Some(state) if !state.is_expired(self.inner.settings.expiry_margin) => Ok(state),
            Some(state) => {
                tracing::debug!(
                    "Token expired at {:?}, reauthenticating",
                    state.expires_at
                );
                self.reauthenticate_after(state.generation).await
            }
            None => self.authenticate().await,
        }
    }

    /// Look up a base URL in the session's catalog
    pub async fn resolve_endpoint(&self, opts: &EndpointOpts) -> Result<Endpoint> {
        let state = match self.state().await {
            Some(state) => state,
            None => self.authenticate().await?,
        };
        state.catalog.resolve(opts, &self.inner.settings.microversions)
    }

    async fn generation(&self) -> u64 {
        self.inner
            .state
            .read()
            .await
            .as_ref()
            .map_or(0, |s| s.generation)
    }

    async fn refresh_after(&self, observed: u64) -> Result<Arc<AuthState>> {
        let refresh = {
            let mut slot = self.inner.inflight.lock().await;

            if let Some(current) = self.inner.state.read().await.as_ref() {
                if current.generation != observed {
                    return Ok(current.clone());
                }
            }

            // A finished refresh left behind by a cancelled waiter is stale
            match slot.as_ref().filter(|refresh| refresh.peek().is_none()) {
                Some(refresh) => refresh.clone(),
                None => {
                    let refresh = self.start_refresh()?;
                    *slot = Some(refresh.clone());
                    refresh
                }
            }
        };

        let result = refresh.clone().await;

        let mut slot = self.inner.inflight.lock().await;
        if slot.as_ref().is_some_and(|r| r.ptr_eq(&refresh)) {
            *slot = None;
        }
        result
    }

    fn start_refresh(&self) -> Result<InflightAuth> {
        let (http, options) = match &self.inner.credentials {
            Credentials::Identity { http, options } => (http.clone(), options.clone()),
            Credentials::Static => {
                return Err(Error::Authentication {
                    message: "session was created from a static token and has no credentials"
                        .to_string(),
                    status: None,
                    request_id: None,
                })
            }
        };
        let inner = Arc::clone(&self.inner);

        Ok(async move {
            let (token, body) = request_token(&http, &options).await?;

            let mut state = inner.state.write().await;
            let generation = state.as_ref().map_or(1, |s| s.generation + 1);
            let fresh = Arc::new(AuthState {
                token,
                expires_at: Some(body.expires_at),
                catalog: Catalog::new(body.catalog),
                user_id: body.user.map(|u| u.id),
                project_id: body.project.map(|p| p.id),
                generation,
            });
            *state = Some(Arc::clone(&fresh));

            tracing::debug!(
                "New token cached (generation {}), expires at {}",
                generation,
                body.expires_at
            );
            Ok(fresh)
        }
        .boxed()
        .shared())
    }
}

async fn request_token(http: &Client, options: &AuthOptions) -> Result<(String, TokenBody)> {
    let url = options.token_url()?;
    let body = options.to_request_body()?;

    tracing::debug!("POST {}", url);

    let response = http
        .post(url.clone())
        .json(&body)
        .send()
        .await
        .map_err(|e| Error::unreachable(url.as_str(), e))?;

    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .bytes()
        .await
        .map_err(|e| Error::unreachable(url.as_str(), e))?;

    if !matches!(status, StatusCode::OK | StatusCode::CREATED) {
        let api = error::classify(
            &Method::POST,
            url.as_str(),
            status,
            &headers,
            bytes,
            &[StatusCode::CREATED],
        );
        tracing::warn!("Identity service rejected authentication: {}", api);
        return Err(match status.as_u16() {
            400 | 401 | 403 => Error::Authentication {
                message: api.message,
                status: Some(status.as_u16()),
                request_id: api.request_id,
            },
            _ => api.into(),
        });
    }

    let token = headers
        .get(SUBJECT_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::protocol(url.as_str(), "identity response has no X-Subject-Token header"))?
        .to_string();

    let parsed: TokenResponse = serde_json::from_slice(&bytes)
        .map_err(|e| Error::protocol(url.as_str(), format!("unexpected token response: {}", e)))?;

    Ok((token, parsed.token))
}
