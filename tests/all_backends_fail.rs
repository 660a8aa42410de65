//! Scenario: every chain step fails
//!
//! Local refuses connections, the cloud answers 401. The caller gets a
//! structured error retaining both failures in order, and the store keeps
//! the user's question plus a system-role stub marking the failure.

mod common;

use common::{cloud_entry, facade_with, local_entry_at, test_config};
use thriftroute::error::RouterError;
use thriftroute::facade::{QueryRequest, ALL_FAILED_STUB};
use thriftroute::registry::Provider;
use thriftroute::store::Role;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn failures_are_retained_and_the_question_stays_searchable() {
    let cloud = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid x-api-key"))
        .expect(1) // auth errors are terminal: exactly one call
        .mount(&cloud)
        .await;

    std::env::set_var("ANTHROPIC_API_KEY", "sk-ant-bad");
    std::env::set_var("ANTHROPIC_BASE_URL", cloud.uri());

    let mut config = test_config();
    config.server.request_timeout_seconds = 10;
    let facade = facade_with(
        config,
        vec![
            // Nothing listens on this port: connection refused.
            local_entry_at("http://127.0.0.1:19985", "qwen3-4b"),
            cloud_entry(Provider::Anthropic, "claude-sonnet-4-5"),
        ],
    )
    .await;

    let err = facade
        .handle_query(QueryRequest {
            input: "does anything work".to_string(),
            ..Default::default()
        })
        .await
        .expect_err("every backend fails");

    let RouterError::AllBackendsFailed { failures } = &err else {
        panic!("expected AllBackendsFailed, got {err:?}");
    };
    // Both failures retained, in chain order.
    assert_eq!(failures.len(), 2);
    assert!(failures[0].starts_with("local"));
    assert!(failures[0].contains("connection-refused"));
    assert!(failures[1].starts_with("cloud"));
    assert!(failures[1].contains("auth"));

    // The store kept the question and a failure stub.
    let conversations = facade
        .store()
        .list_conversations(&Default::default())
        .await
        .unwrap();
    assert_eq!(conversations.len(), 1);
    let messages = facade
        .store()
        .get_messages(conversations[0].id, None, None)
        .await
        .unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "does anything work");
    assert_eq!(messages[1].role, Role::System);
    assert_eq!(messages[1].content, ALL_FAILED_STUB);

    // The question remains searchable.
    let hits = facade
        .store()
        .search_conversations("anything work", &Default::default())
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);

    // No secrets leak through the error surface.
    for failure in failures {
        assert!(!failure.contains("sk-ant-bad"));
    }
}
