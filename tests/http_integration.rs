//! Integration tests for the request executor using wiremock
//!
//! These tests verify request assembly, status classification, and the
//! reauthenticate-and-retry path against mocked endpoints.

mod common;

use chrono::Duration as ChronoDuration;
use common::*;
use reqwest::header::{HeaderName, HeaderValue, ACCEPT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use stackcore::openstack::body::Field;
use stackcore::openstack::client::new_request_id;
use stackcore::openstack::{
    Endpoint, EndpointOpts, MicroversionRange, MicroversionTable, ProviderClient, RequestOpts,
    ServiceClient,
};
use stackcore::ErrorKind;
use std::collections::HashMap;
use wiremock::matchers::{body_json, header, header_exists, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

/// Service client on a static token, pointing at `{server}/compute/v2.1`
fn compute_client(server: &MockServer) -> ServiceClient {
    let provider = ProviderClient::builder()
        .user_agent_prefix("acceptance/1.0")
        .with_token("static-token", None)
        .unwrap();
    let endpoint = Endpoint::new("compute", &format!("{}/compute/v2.1", server.uri())).unwrap();
    ServiceClient::new(provider, endpoint)
}

#[derive(Debug, Default, Serialize)]
struct NodeGroupCreateOpts {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    flavor_id: Option<String>,
    #[serde(skip_serializing_if = "Field::is_unset")]
    node_count: Field<u32>,
    #[serde(skip_serializing_if = "Field::is_unset")]
    min_node_count: Field<u32>,
    #[serde(skip_serializing_if = "Field::is_unset")]
    merge_labels: Field<bool>,
    #[serde(skip_serializing_if = "Field::is_unset")]
    labels: Field<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Field::is_unset")]
    image_id: Field<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct NodeGroup {
    uuid: String,
    name: String,
    node_count: u32,
}

mod request_tests {
    use super::*;

    /// Default headers are sent and the body is decoded
    #[tokio::test]
    async fn test_get_sends_default_headers() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/compute/v2.1/servers/abc"))
            .and(header("X-Auth-Token", "static-token"))
            .and(header("Accept", "application/json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Compute-Request-Id", "req-compute-1")
                    .set_body_json(json!({"server": {"id": "abc", "name": "vm-1"}})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = compute_client(&server);
        let page = client
            .get(client.service_url(&["servers", "abc"]).unwrap())
            .await
            .unwrap();

        assert_eq!(page.status(), StatusCode::OK);
        assert_eq!(page.request_id().as_deref(), Some("req-compute-1"));
        let server_json: Value = page.extract_key("server").unwrap();
        assert_eq!(server_json["name"], "vm-1");

        let requests = server.received_requests().await.unwrap();
        let agent = requests[0].headers.get("user-agent").unwrap().to_str().unwrap();
        assert!(agent.starts_with("acceptance/1.0 stackcore/"));
    }

    /// Unset fields never reach the wire; explicit false/0/empty values do
    #[tokio::test]
    async fn test_post_omits_unset_fields() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/compute/v2.1/nodegroups"))
            .and(header("Content-Type", "application/json"))
            .and(body_json(json!({
                "nodegroup": {
                    "name": "ng",
                    "node_count": 0,
                    "merge_labels": false,
                    "labels": {}
                }
            })))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({
                "nodegroup": {"uuid": "ng-1", "name": "ng", "node_count": 0}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let opts = NodeGroupCreateOpts {
            name: "ng".to_string(),
            node_count: Field::Set(0),
            merge_labels: Field::Set(false),
            labels: Field::Set(HashMap::new()),
            image_id: Field::Null,
            ..Default::default()
        };

        let client = compute_client(&server);
        let request = RequestOpts::post().json_from(&opts, Some("nodegroup")).unwrap();
        let page = client
            .request(client.service_url(&["nodegroups"]).unwrap(), request)
            .await
            .unwrap();

        let created: NodeGroup = page.extract_key("nodegroup").unwrap();
        assert_eq!(created.uuid, "ng-1");
        assert_eq!(created.name, "ng");
        assert_eq!(created.node_count, 0);
    }

    /// With null-keeping turned on an explicit null is transmitted
    #[tokio::test]
    async fn test_keep_nulls_sends_explicit_null() {
        let server = MockServer::start().await;

        Mock::given(method("PATCH"))
            .and(path("/compute/v2.1/nodegroups/ng-1"))
            .and(body_json(json!({"name": "ng", "image_id": null})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let opts = NodeGroupCreateOpts {
            name: "ng".to_string(),
            image_id: Field::Null,
            ..Default::default()
        };

        let client = compute_client(&server);
        let request = RequestOpts::patch().json_from(&opts, None).unwrap().keep_nulls();
        client
            .request(client.service_url(&["nodegroups", "ng-1"]).unwrap(), request)
            .await
            .unwrap();
    }

    /// Caller overrides win over defaults, omitted headers are not sent
    #[tokio::test]
    async fn test_header_overrides_and_omissions() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/compute/v2.1/console"))
            .and(header("Accept", "text/plain"))
            .and(header("X-Trace", "on"))
            .respond_with(ResponseTemplate::new(200).set_body_string("console output"))
            .expect(1)
            .mount(&server)
            .await;

        let client = compute_client(&server);
        let request = RequestOpts::get()
            .header(ACCEPT, HeaderValue::from_static("text/plain"))
            .header(HeaderName::from_static("x-trace"), HeaderValue::from_static("on"))
            .omit_header(HeaderName::from_static("x-auth-token"));
        let page = client
            .request(client.service_url(&["console"]).unwrap(), request)
            .await
            .unwrap();

        assert_eq!(page.text(), "console output");
        let requests = server.received_requests().await.unwrap();
        assert!(requests[0].headers.get("x-auth-token").is_none());
    }

    /// A global request id is attached to every call
    #[tokio::test]
    async fn test_global_request_id() {
        let server = MockServer::start().await;
        let request_id = new_request_id();

        Mock::given(method("GET"))
            .and(path("/compute/v2.1/flavors"))
            .and(header("X-OpenStack-Request-ID", request_id.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"flavors": []})))
            .expect(1)
            .mount(&server)
            .await;

        let provider = ProviderClient::builder()
            .global_request_id(request_id.clone())
            .with_token("tok", None)
            .unwrap();
        let endpoint = Endpoint::new("compute", &format!("{}/compute/v2.1", server.uri())).unwrap();
        let client = ServiceClient::new(provider, endpoint);
        client.get(client.service_url(&["flavors"]).unwrap()).await.unwrap();
    }

    /// DELETE with 204 and no body decodes to an empty value
    #[tokio::test]
    async fn test_delete_no_content() {
        let server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/compute/v2.1/servers/abc"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = compute_client(&server);
        let page = client
            .delete(client.service_url(&["servers", "abc"]).unwrap())
            .await
            .unwrap();
        assert_eq!(page.status(), StatusCode::NO_CONTENT);
        page.extract_into::<()>().unwrap();
        assert!(page.extract_into::<Option<Value>>().unwrap().is_none());
    }

    /// The Location header is exposed resolved against the request URL
    #[tokio::test]
    async fn test_location_header() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/compute/v2.1/servers/abc/action"))
            .respond_with(ResponseTemplate::new(202).insert_header("Location", "/compute/v2.1/servers/abc/console"))
            .mount(&server)
            .await;

        let client = compute_client(&server);
        let page = client
            .post(
                client.service_url(&["servers", "abc", "action"]).unwrap(),
                json!({"os-getConsoleOutput": {}}),
            )
            .await
            .unwrap();
        assert_eq!(
            page.location().unwrap().as_str(),
            format!("{}/compute/v2.1/servers/abc/console", server.uri())
        );
    }
}

mod microversion_tests {
    use super::*;

    /// Microversioned services get the generic and the legacy header
    #[tokio::test]
    async fn test_compute_microversion_headers() {
        let server = MockServer::start().await;
        mount_identity(&server, "tok").await;

        Mock::given(method("GET"))
            .and(path("/compute/v2.1/servers/detail"))
            .and(header("OpenStack-API-Version", "compute 2.79"))
            .and(header("X-OpenStack-Nova-API-Version", "2.79"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"servers": []})))
            .expect(1)
            .mount(&server)
            .await;

        let provider = ProviderClient::builder()
            .microversions(MicroversionTable::new().with(
                "compute",
                MicroversionRange::new("2.1".parse().unwrap(), "2.90".parse().unwrap()),
            ))
            .authenticate(auth_options(&server))
            .await
            .unwrap();

        let compute = provider
            .service_client(&EndpointOpts::new("compute").microversion("2.79"))
            .await
            .unwrap();
        compute
            .get(compute.service_url(&["servers", "detail"]).unwrap())
            .await
            .unwrap();
    }

    /// A microversion outside the declared range is rejected before sending
    #[tokio::test]
    async fn test_unsupported_microversion_is_not_sent() {
        let server = MockServer::start().await;
        mount_identity(&server, "tok").await;

        let provider = ProviderClient::builder()
            .microversions(MicroversionTable::new().with(
                "compute",
                MicroversionRange::new("2.1".parse().unwrap(), "2.90".parse().unwrap()),
            ))
            .authenticate(auth_options(&server))
            .await
            .unwrap();
        let compute = provider
            .service_client(&EndpointOpts::new("compute"))
            .await
            .unwrap();

        let err = compute
            .request(
                compute.service_url(&["servers"]).unwrap(),
                RequestOpts::get().microversion("2.95"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedMicroversion);

        let err = provider
            .service_client(&EndpointOpts::new("container-infra").microversion("1.9"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedMicroversion);
    }
}

mod provider_microversion_tests {
    use super::*;

    /// A microversion on a provider-level request fails without sending;
    /// the same request through a service client carries the headers
    #[tokio::test]
    async fn test_provider_request_with_microversion() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/compute/v2.1/servers"))
            .and(header("OpenStack-API-Version", "compute 2.60"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"servers": []})))
            .expect(1)
            .mount(&server)
            .await;

        let provider = ProviderClient::builder().with_token("tok", None).unwrap();
        let url = reqwest::Url::parse(&format!("{}/compute/v2.1/servers", server.uri())).unwrap();
        let err = provider
            .request(url.clone(), &RequestOpts::get().microversion("99.99"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedMicroversion);

        let endpoint = Endpoint::new("compute", &format!("{}/compute/v2.1", server.uri()))
            .unwrap()
            .with_microversions(MicroversionRange::new(
                "2.1".parse().unwrap(),
                "2.90".parse().unwrap(),
            ));
        let compute = ServiceClient::new(provider, endpoint);
        compute
            .request(url, RequestOpts::get().microversion("2.60"))
            .await
            .unwrap();
    }
}

mod error_tests {
    use super::*;

    /// 404 with an empty body is NotFound with a non-empty message
    #[tokio::test]
    async fn test_404_empty_body() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/compute/v2.1/servers/missing"))
            .respond_with(ResponseTemplate::new(404).insert_header("X-OpenStack-Request-Id", "req-404"))
            .mount(&server)
            .await;

        let client = compute_client(&server);
        let err = client
            .get(client.service_url(&["servers", "missing"]).unwrap())
            .await
            .unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(err.request_id(), Some("req-404"));
        let api = err.api().unwrap();
        assert!(!api.message.is_empty());
        assert_eq!(api.expected, vec![200]);
    }

    /// Service-specific payloads are mined for the message
    #[tokio::test]
    async fn test_error_payload_message() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/compute/v2.1/servers"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "conflictingRequest": {"code": 409, "message": "Cannot 'start' instance while it is in vm_state active"}
            })))
            .mount(&server)
            .await;

        let client = compute_client(&server);
        let err = client
            .post(client.service_url(&["servers"]).unwrap(), json!({"server": {}}))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Conflict);
        let api = err.api().unwrap();
        assert_eq!(api.error_name.as_deref(), Some("conflictingRequest"));
        assert!(api.message.contains("vm_state active"));
        assert_eq!(api.body_json().unwrap()["conflictingRequest"]["code"], 409);
    }

    /// A 2xx outside the expected set is still an error
    #[tokio::test]
    async fn test_unexpected_success_status() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/compute/v2.1/servers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let client = compute_client(&server);
        let err = client
            .post(client.service_url(&["servers"]).unwrap(), json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedStatus(200));

        let ok = client
            .request(
                client.service_url(&["servers"]).unwrap(),
                RequestOpts::post().json(json!({})).ok_codes([StatusCode::OK]),
            )
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
    }

    /// Connection failures are unreachable errors
    #[tokio::test]
    async fn test_unreachable_service() {
        let provider = ProviderClient::builder().with_token("tok", None).unwrap();
        let endpoint = Endpoint::new("compute", "http://127.0.0.1:1/v2.1").unwrap();
        let client = ServiceClient::new(provider, endpoint);

        let err = client
            .get(client.service_url(&["servers"]).unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unreachable);
    }
}

mod retry_tests {
    use super::*;

    /// A rejected token is refreshed once and the request retried
    #[tokio::test]
    async fn test_401_reauthenticates_and_retries() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(token_response(&server, "revoked", ChronoDuration::hours(1)))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        mount_identity(&server, "replacement").await;

        Mock::given(method("GET"))
            .and(path("/compute/v2.1/servers"))
            .and(header("X-Auth-Token", "revoked"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/compute/v2.1/servers"))
            .and(header("X-Auth-Token", "replacement"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"servers": [{"id": "a"}]})))
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider(&server).await;
        let compute = provider
            .service_client(&EndpointOpts::new("compute"))
            .await
            .unwrap();
        let page = compute
            .get(compute.service_url(&["servers"]).unwrap())
            .await
            .unwrap();

        let items: Vec<Value> = page.extract_items(None).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(identity_calls(&server).await, 2);
    }

    /// A service that keeps answering 401 is called exactly twice
    #[tokio::test]
    async fn test_persistent_401_gives_up_after_one_retry() {
        let server = MockServer::start().await;
        mount_identity(&server, "tok").await;

        Mock::given(method("GET"))
            .and(path("/compute/v2.1/servers"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {"code": 401, "message": "The request you have made requires authentication.", "title": "Unauthorized"}
            })))
            .expect(2)
            .mount(&server)
            .await;

        let provider = provider(&server).await;
        let compute = provider
            .service_client(&EndpointOpts::new("compute"))
            .await
            .unwrap();
        let err = compute
            .get(compute.service_url(&["servers"]).unwrap())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert_eq!(identity_calls(&server).await, 2);
    }

    /// 419 is treated like 401
    #[tokio::test]
    async fn test_419_reauthenticates() {
        let server = MockServer::start().await;
        mount_identity(&server, "tok").await;

        Mock::given(method("GET"))
            .and(path("/compute/v2.1/limits"))
            .respond_with(ResponseTemplate::new(419))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/compute/v2.1/limits"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"limits": {}})))
            .mount(&server)
            .await;

        let provider = provider(&server).await;
        let compute = provider
            .service_client(&EndpointOpts::new("compute"))
            .await
            .unwrap();
        compute
            .get(compute.service_url(&["limits"]).unwrap())
            .await
            .unwrap();
        assert_eq!(identity_calls(&server).await, 2);
    }

    /// Requests that opt out of reauthentication fail on the first 401
    #[tokio::test]
    async fn test_no_reauth_request() {
        let server = MockServer::start().await;
        mount_identity(&server, "tok").await;

        Mock::given(method("GET"))
            .and(path("/compute/v2.1/servers"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider(&server).await;
        let compute = provider
            .service_client(&EndpointOpts::new("compute"))
            .await
            .unwrap();
        let err = compute
            .request(compute.service_url(&["servers"]).unwrap(), RequestOpts::get().no_reauth())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert_eq!(identity_calls(&server).await, 1);
    }

    /// Static-token clients cannot reauthenticate, so a 401 is final
    #[tokio::test]
    async fn test_static_token_401() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/compute/v2.1/servers"))
            .respond_with(|_: &Request| ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let client = compute_client(&server);
        let err = client
            .get(client.service_url(&["servers"]).unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }
}

/// HEAD on the service root still carries a user agent
#[tokio::test]
async fn test_user_agent_always_present() {
    let server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .and(path("/compute/v2.1/"))
        .and(header_exists("User-Agent"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = compute_client(&server);
    let page = client.head(client.url("").unwrap()).await.unwrap();
    assert_eq!(page.status(), StatusCode::NO_CONTENT);
}
