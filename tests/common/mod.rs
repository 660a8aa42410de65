//! Shared helpers for the integration tests
//!
//! Builds in-memory routers with synthetic registry snapshots whose entries
//! point at wiremock servers, so no real runtime or cloud endpoint is ever
//! contacted.

#![allow(dead_code)]

use chrono::Utc;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use thriftroute::config::{Config, ModelPricing};
use thriftroute::facade::RouterFacade;
use thriftroute::probe::{Capabilities, RuntimeDescriptor, RuntimeKind};
use thriftroute::registry::{ModelEntry, Provider, RegistrySnapshot};

pub const BASE_CONFIG: &str = r#"
server:
  host: "127.0.0.1"
  port: 8000
  request_timeout_seconds: 30

models:
  local:
    endpoint: "http://localhost:1234/v1"
    model: "qwen3-4b"
  cloud:
    provider: "anthropic"
    model: "claude-sonnet-4-5"

routing:
  hard_rules:
    - triggers: ["見積"]
      model: "cloud:claude-sonnet-4-5"
      reason: "cost estimates need the stronger model"
  intelligent_routing:
    enabled: false
    confidence_threshold: 0.75
    triage_prompt: "Classify this request: {input}"
    classifier_model: "qwen3-4b"

fallback:
  chain: ["local", "cloud"]

cost:
  pricing:
    claude-sonnet-4-5:
      input: 3.0
      output: 15.0
  fx_rate: 1.0

database:
  path: "data/conversations.db"
"#;

/// The shared test configuration, with fast retries.
pub fn test_config() -> Config {
    let mut config = Config::from_str(BASE_CONFIG).expect("base config parses");
    config.retry.base_delay_ms = 20;
    config.retry.max_delay_ms = 100;
    config
}

/// A reachable local registry entry hosted at the given origin.
pub fn local_entry_at(origin: &str, id: &str) -> ModelEntry {
    ModelEntry {
        id: id.to_string(),
        display_name: id.to_string(),
        runtime: Some(RuntimeDescriptor {
            kind: RuntimeKind::Lmstudio,
            base_url: origin.trim_end_matches('/').to_string(),
            reachable: true,
            last_probed_at: Some(Utc::now()),
        }),
        provider: Provider::Local,
        capabilities: Capabilities {
            text: true,
            vision: false,
            reasoning: false,
            tools: false,
        },
        context_tokens: 8192,
        pricing: ModelPricing {
            input: 0.0,
            output: 0.0,
        },
    }
}

/// An unreachable local entry (probe failed at a dead port).
pub fn dead_local_entry(id: &str) -> ModelEntry {
    let mut entry = local_entry_at("http://127.0.0.1:19986", id);
    entry.runtime.as_mut().unwrap().reachable = false;
    entry
}

/// A cloud registry entry. The backend reads `<PROVIDER>_BASE_URL` from the
/// environment, which tests point at a wiremock server.
pub fn cloud_entry(provider: Provider, id: &str) -> ModelEntry {
    ModelEntry {
        id: id.to_string(),
        display_name: id.to_string(),
        runtime: None,
        provider,
        capabilities: Capabilities {
            text: true,
            vision: true,
            reasoning: true,
            tools: true,
        },
        context_tokens: provider.default_context(),
        pricing: ModelPricing {
            input: 3.0,
            output: 15.0,
        },
    }
}

/// Build an in-memory router and install the given registry entries.
pub async fn facade_with(config: Config, entries: Vec<ModelEntry>) -> Arc<RouterFacade> {
    let facade = Arc::new(
        RouterFacade::new_in_memory(config)
            .await
            .expect("facade builds"),
    );
    install_entries(&facade, entries);
    facade
}

/// Replace the facade's registry table.
pub fn install_entries(facade: &Arc<RouterFacade>, entries: Vec<ModelEntry>) {
    let entries: BTreeMap<String, ModelEntry> =
        entries.into_iter().map(|e| (e.key(), e)).collect();
    facade.registry().install_snapshot(RegistrySnapshot {
        entries,
        last_scan_at: Some(Utc::now()),
        ttl_seconds: 300,
        refreshed: true,
    });
}

/// Read a response body as JSON.
pub async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body reads");
    serde_json::from_slice(&bytes).expect("body is JSON")
}
