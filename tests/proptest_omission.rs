//! Property-based tests using proptest
//!
//! These tests verify the omission rule for request bodies and queries,
//! error classification, log sanitizing, and page concatenation using
//! randomized inputs.

use proptest::prelude::*;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde_json::{json, Value};
use stackcore::error::classify;
use stackcore::openstack::body::{build_request_body, prune_unset};
use stackcore::openstack::http::sanitize_for_log;
use stackcore::openstack::query::build_query;
use stackcore::openstack::{Endpoint, Field, ProviderClient, ServiceClient};
use stackcore::pagination::BodyLink;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Debug, Clone, Serialize)]
struct ClusterUpdateOpts {
    #[serde(skip_serializing_if = "Field::is_unset")]
    node_count: Field<u32>,
    #[serde(skip_serializing_if = "Field::is_unset")]
    master_lb_enabled: Field<bool>,
    #[serde(skip_serializing_if = "Field::is_unset")]
    description: Field<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    keypair: Option<String>,
}

/// Unset, null, or an explicit value that includes the zero value
fn arb_field<T: std::fmt::Debug + Clone + 'static>(
    value: impl Strategy<Value = T> + 'static,
) -> impl Strategy<Value = Field<T>> {
    prop_oneof![
        Just(Field::Unset),
        Just(Field::Null),
        value.prop_map(Field::Set),
    ]
}

fn arb_update_opts() -> impl Strategy<Value = ClusterUpdateOpts> {
    (
        arb_field(prop_oneof![Just(0u32), 1u32..100]),
        arb_field(any::<bool>()),
        arb_field(prop_oneof![Just(String::new()), "[a-z ]{1,20}"]),
        prop::option::of("[a-z0-9-]{0,12}"),
    )
        .prop_map(|(node_count, master_lb_enabled, description, keypair)| ClusterUpdateOpts {
            node_count,
            master_lb_enabled,
            description,
            keypair,
        })
}

/// Generate a list of pages, each holding a few item ids
fn arb_pages() -> impl Strategy<Value = Vec<Vec<u32>>> {
    prop::collection::vec(prop::collection::vec(0u32..10_000, 1..4), 1..5)
}

fn arb_error_body() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(String::new()),
        "[ -~]{0,80}",
        "[a-zA-Z ]{0,40}".prop_map(|m| json!({"itemNotFound": {"message": m, "code": 404}}).to_string()),
        "[a-zA-Z ]{0,40}".prop_map(|m| json!({"error": {"message": m}}).to_string()),
        "[a-zA-Z ]{0,40}".prop_map(|m| json!({"faultstring": m}).to_string()),
    ]
}

fn present(field: &Field<impl Sized>) -> bool {
    field.is_set()
}

proptest! {
    /// Unset and null fields never reach the wire, explicit values always do
    #[test]
    fn body_keeps_exactly_the_set_fields(opts in arb_update_opts()) {
        let mut body = build_request_body(&opts, Some("cluster")).unwrap();
        prune_unset(&mut body);
        let cluster = body["cluster"].as_object().unwrap();

        prop_assert_eq!(cluster.contains_key("node_count"), present(&opts.node_count));
        prop_assert_eq!(cluster.contains_key("master_lb_enabled"), present(&opts.master_lb_enabled));
        prop_assert_eq!(cluster.contains_key("description"), present(&opts.description));
        prop_assert_eq!(cluster.contains_key("keypair"), opts.keypair.is_some());

        if let Field::Set(count) = opts.node_count {
            prop_assert_eq!(&cluster["node_count"], &json!(count));
        }
        if let Field::Set(enabled) = opts.master_lb_enabled {
            prop_assert_eq!(&cluster["master_lb_enabled"], &json!(enabled));
        }
    }

    /// Query strings follow the same omission rule as bodies
    #[test]
    fn query_keeps_exactly_the_set_fields(opts in arb_update_opts()) {
        let pairs = build_query(&opts).unwrap();
        let has = |key: &str| pairs.iter().any(|(k, _)| k == key);

        prop_assert_eq!(has("node_count"), present(&opts.node_count));
        prop_assert_eq!(has("master_lb_enabled"), present(&opts.master_lb_enabled));
        prop_assert_eq!(has("description"), present(&opts.description));
        prop_assert_eq!(has("keypair"), opts.keypair.is_some());
    }

    /// Every non-expected status yields a non-empty message
    #[test]
    fn classified_errors_have_messages(status in 400u16..600, body in arb_error_body()) {
        let status = StatusCode::from_u16(status).unwrap();
        let err = classify(
            &Method::GET,
            "http://compute.example/v2.1/servers",
            status,
            &HeaderMap::new(),
            body.into(),
            &[StatusCode::OK],
        );
        prop_assert!(!err.message.is_empty());
        prop_assert_eq!(err.status, status);
    }

    /// Sanitizing never panics and never keeps control characters
    #[test]
    fn sanitize_is_bounded(body in "\\PC{0,400}", noise in "[\\x00-\\x1f]{0,5}") {
        let input = format!("{}{}", noise, body);
        let sanitized = sanitize_for_log(&input);
        prop_assert!(!sanitized.chars().any(char::is_control));
        prop_assert!(sanitized.len() <= 200 + 64);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    /// Walking linked pages yields every item once, in server order
    #[test]
    fn pages_concatenate_in_order(pages in arb_pages()) {
        let expected: Vec<u32> = pages.iter().flatten().copied().collect();

        let items = tokio_test::block_on(async {
            let server = MockServer::start().await;
            for (i, page) in pages.iter().enumerate() {
                let next = (i + 1 < pages.len())
                    .then(|| format!("{}/v1/items?page={}", server.uri(), i + 1));
                Mock::given(method("GET"))
                    .and(path("/v1/items"))
                    .and(query_param("page", i.to_string()))
                    .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                        "items": page,
                        "next": next
                    })))
                    .expect(1)
                    .mount(&server)
                    .await;
            }

            let provider = ProviderClient::builder().with_token("tok", None).unwrap();
            let endpoint = Endpoint::new("items", &format!("{}/v1", server.uri())).unwrap();
            let client = ServiceClient::new(provider, endpoint);
            let mut pager = client
                .list(client.url("items").unwrap(), &json!({"page": 0}), BodyLink::new())
                .await
                .unwrap();
            pager.all_items::<Value>().await.unwrap()
        });

        let ids: Vec<u32> = items.iter().map(|v| v.as_u64().unwrap() as u32).collect();
        prop_assert_eq!(ids, expected);
    }
}
