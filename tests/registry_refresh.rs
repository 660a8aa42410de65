//! Registry refresh against a live (mocked) runtime
//!
//! Drives the real probe path: the configured local endpoint answers the
//! OpenAI-compatible model listing, the refresh publishes the entries, and
//! observers hear the change set.

mod common;

use common::test_config;
use serde_json::json;
use std::sync::Arc;
use thriftroute::facade::RouterFacade;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn refresh_discovers_models_and_notifies_observers() {
    let runtime = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {"id": "qwen3-4b", "owned_by": "lmstudio"},
                {"id": "qwen2-vl-7b", "owned_by": "lmstudio"}
            ]
        })))
        .mount(&runtime)
        .await;

    // No cloud credentials: only local discovery feeds the table.
    std::env::remove_var("ANTHROPIC_API_KEY");

    let mut config = test_config();
    config.models.local.endpoint = format!("{}/v1", runtime.uri());

    let facade = Arc::new(RouterFacade::new_in_memory(config).await.unwrap());
    let mut changes = facade.registry().subscribe();

    // Before any refresh the table is empty and stale.
    let snapshot = facade.registry().snapshot_unchecked();
    assert!(snapshot.is_stale());

    let change = facade.refresh_registry().await;
    assert!(change.added.contains(&"local:qwen3-4b".to_string()));
    assert!(change.added.contains(&"local:qwen2-vl-7b".to_string()));

    let snapshot = facade.registry().snapshot_unchecked();
    assert!(!snapshot.is_stale(), "fresh refresh is within TTL");

    let entry = snapshot.entries.get("local:qwen3-4b").expect("discovered");
    let descriptor = entry.runtime.as_ref().expect("local entries carry a runtime");
    assert!(descriptor.reachable);
    assert_eq!(descriptor.base_url, runtime.uri());
    assert_eq!(entry.pricing.input, 0.0);
    assert_eq!(entry.pricing.output, 0.0);

    // Vision capability inferred from the id.
    let vl = snapshot.entries.get("local:qwen2-vl-7b").unwrap();
    assert!(vl.capabilities.vision);

    // Observers got the same change set.
    let observed = changes.recv().await.expect("change delivered");
    assert_eq!(observed.added.len(), change.added.len());

    // A second refresh with the same listing reports no changes and does
    // not wake observers.
    let change = facade.refresh_registry().await;
    assert!(change.is_empty());
}
