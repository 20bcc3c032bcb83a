//! Shared fixtures for integration tests: a mock identity service whose
//! catalog points back at the same mock server.

#![allow(dead_code)]

use chrono::{Duration, SecondsFormat, Utc};
use serde_json::{json, Value};
use stackcore::openstack::{AuthOptions, ProviderClient};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TOKEN_PATH: &str = "/identity/v3/auth/tokens";

pub fn auth_options(server: &MockServer) -> AuthOptions {
    AuthOptions {
        identity_endpoint: format!("{}/identity/v3", server.uri()),
        username: Some("demo".to_string()),
        password: Some("secret".to_string()),
        user_domain_name: Some("Default".to_string()),
        project_name: Some("demo".to_string()),
        allow_reauth: true,
        ..Default::default()
    }
}

/// Catalog with compute and container-infra in two regions
pub fn catalog(server: &MockServer) -> Value {
    let uri = server.uri();
    json!([
        {
            "type": "identity",
            "name": "keystone",
            "endpoints": [
                {"id": "1", "interface": "public", "region": "RegionOne", "region_id": "RegionOne", "url": format!("{}/identity/v3", uri)}
            ]
        },
        {
            "type": "compute",
            "name": "nova",
            "endpoints": [
                {"id": "2", "interface": "public", "region": "RegionOne", "region_id": "RegionOne", "url": format!("{}/compute/v2.1", uri)},
                {"id": "3", "interface": "internal", "region": "RegionOne", "region_id": "RegionOne", "url": format!("{}/internal/compute/v2.1", uri)},
                {"id": "4", "interface": "public", "region": "RegionTwo", "region_id": "RegionTwo", "url": format!("{}/region-two/compute/v2.1", uri)}
            ]
        },
        {
            "type": "container-infra",
            "name": "magnum",
            "endpoints": [
                {"id": "5", "interface": "public", "region": "RegionOne", "region_id": "RegionOne", "url": format!("{}/magnum/v1", uri)}
            ]
        }
    ])
}

/// Successful identity response for `token`, expiring `expires_in` from now
pub fn token_response(server: &MockServer, token: &str, expires_in: Duration) -> ResponseTemplate {
    let expires_at = (Utc::now() + expires_in).to_rfc3339_opts(SecondsFormat::Micros, true);
    ResponseTemplate::new(201)
        .insert_header("X-Subject-Token", token)
        .set_body_json(json!({
            "token": {
                "methods": ["password"],
                "expires_at": expires_at,
                "user": {"id": "u-1", "name": "demo"},
                "project": {"id": "p-1", "name": "demo"},
                "catalog": catalog(server)
            }
        }))
}

/// Identity service that hands out `token`, valid for an hour
pub async fn mount_identity(server: &MockServer, token: &str) {
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(token_response(server, token, Duration::hours(1)))
        .mount(server)
        .await;
}

pub async fn provider(server: &MockServer) -> ProviderClient {
    ProviderClient::authenticate(auth_options(server))
        .await
        .expect("authentication should succeed")
}

/// Identity calls the mock server has seen so far
pub async fn identity_calls(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == TOKEN_PATH)
        .count()
}
