//! Runtime probe: liveness and model discovery for local LLM runtimes
//!
//! Each runtime kind speaks its own "list models" dialect over HTTP. The
//! probe performs one request against the kind-specific endpoint and returns
//! a normalized report. It never mutates shared state; the registry consumes
//! the pure values it returns.

use crate::error::{AppResult, RouterError};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Maximum probes in flight during a scan.
const MAX_IN_FLIGHT: usize = 8;

/// Hostnames always admitted by the scan guard.
const LOOPBACK_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1", "[::1]"];

/// Known local runtime kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeKind {
    Lmstudio,
    Ollama,
    Llamacpp,
    Koboldcpp,
    Jan,
    Gpt4all,
    Vllm,
    GenericOpenai,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::Lmstudio => "lmstudio",
            RuntimeKind::Ollama => "ollama",
            RuntimeKind::Llamacpp => "llamacpp",
            RuntimeKind::Koboldcpp => "koboldcpp",
            RuntimeKind::Jan => "jan",
            RuntimeKind::Gpt4all => "gpt4all",
            RuntimeKind::Vllm => "vllm",
            RuntimeKind::GenericOpenai => "generic-openai",
        }
    }

    /// Conventional port the runtime listens on.
    pub fn default_port(&self) -> u16 {
        match self {
            RuntimeKind::Lmstudio => 1234,
            RuntimeKind::Ollama => 11434,
            RuntimeKind::Llamacpp => 8080,
            RuntimeKind::Koboldcpp => 5001,
            RuntimeKind::Jan => 1337,
            RuntimeKind::Gpt4all => 4891,
            RuntimeKind::Vllm => 8888,
            RuntimeKind::GenericOpenai => 8000,
        }
    }

    /// Path of the kind-specific "list models" endpoint.
    fn models_path(&self) -> &'static str {
        match self {
            RuntimeKind::Ollama => "/api/tags",
            _ => "/v1/models",
        }
    }
}

/// Identifies one local LLM endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeDescriptor {
    pub kind: RuntimeKind,
    /// Origin only, e.g. `http://localhost:1234`. The OpenAI-compatible
    /// generation endpoint is `{base_url}/v1`.
    pub base_url: String,
    pub reachable: bool,
    pub last_probed_at: Option<DateTime<Utc>>,
}

impl RuntimeDescriptor {
    /// Base URL of the runtime's OpenAI-compatible API surface.
    pub fn openai_base(&self) -> String {
        format!("{}/v1", self.base_url)
    }
}

/// Why a probe came back negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeFailureKind {
    ConnectionRefused,
    Timeout,
    BadResponse,
}

/// Capability set of a model, inferred or declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub text: bool,
    #[serde(default)]
    pub vision: bool,
    #[serde(default)]
    pub reasoning: bool,
    #[serde(default)]
    pub tools: bool,
}

/// A discovered model before the registry enriches it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStub {
    pub id: String,
    pub display_name: String,
    pub capabilities: Capabilities,
}

/// Outcome of probing one runtime.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub descriptor: RuntimeDescriptor,
    pub models: Vec<ModelStub>,
    pub failure: Option<ProbeFailureKind>,
}

/// Reject base URLs whose host is neither loopback nor explicitly
/// allow-listed. This keeps a poisoned registry from turning the router into
/// a server-side request proxy.
pub fn check_host_allowed(base_url: &str, allowed_hosts: &[String]) -> AppResult<()> {
    let url = reqwest::Url::parse(base_url)
        .map_err(|e| RouterError::Config(format!("Invalid runtime URL '{base_url}': {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| RouterError::Config(format!("Runtime URL '{base_url}' has no host")))?;

    if LOOPBACK_HOSTS.contains(&host) || allowed_hosts.iter().any(|h| h == host) {
        Ok(())
    } else {
        Err(RouterError::Config(format!(
            "Host '{host}' is not loopback and not in scanner.allowed_hosts; refusing to probe"
        )))
    }
}

/// Infer capabilities from a model id.
///
/// Heuristic on purpose: local runtimes rarely report capabilities, but ids
/// follow naming conventions closely enough to be useful.
pub fn infer_capabilities(id: &str) -> Capabilities {
    let lower = id.to_lowercase();
    let vision = ["vision", "-vl", "vl-", "llava", "4o", "pixtral"]
        .iter()
        .any(|m| lower.contains(m));
    let reasoning = ["r1", "reason", "think", "qwq"].iter().any(|m| lower.contains(m));
    let tools = ["coder", "code", "tool"].iter().any(|m| lower.contains(m));
    Capabilities {
        text: true,
        vision,
        reasoning,
        tools,
    }
}

/// Probe one runtime: a single HTTP call against the kind-specific endpoint.
pub async fn probe(
    client: &reqwest::Client,
    kind: RuntimeKind,
    base_url: &str,
    timeout: Duration,
    allowed_hosts: &[String],
) -> ProbeReport {
    let probed_at = Utc::now();
    let mut descriptor = RuntimeDescriptor {
        kind,
        base_url: base_url.trim_end_matches('/').to_string(),
        reachable: false,
        last_probed_at: Some(probed_at),
    };

    if let Err(e) = check_host_allowed(&descriptor.base_url, allowed_hosts) {
        tracing::warn!(base_url = %descriptor.base_url, error = %e, "Refusing to probe disallowed host");
        return ProbeReport {
            descriptor,
            models: Vec::new(),
            failure: Some(ProbeFailureKind::BadResponse),
        };
    }

    let url = format!("{}{}", descriptor.base_url, kind.models_path());
    let response = match client.get(&url).timeout(timeout).send().await {
        Ok(r) => r,
        Err(e) => {
            let failure = if e.is_timeout() {
                ProbeFailureKind::Timeout
            } else {
                ProbeFailureKind::ConnectionRefused
            };
            tracing::debug!(url = %url, kind = kind.as_str(), failure = ?failure, "Probe failed");
            return ProbeReport {
                descriptor,
                models: Vec::new(),
                failure: Some(failure),
            };
        }
    };

    if !response.status().is_success() {
        tracing::debug!(url = %url, status = %response.status(), "Probe got non-2xx");
        return ProbeReport {
            descriptor,
            models: Vec::new(),
            failure: Some(ProbeFailureKind::BadResponse),
        };
    }

    let body: serde_json::Value = match response.json().await {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(url = %url, error = %e, "Probe body was not JSON");
            return ProbeReport {
                descriptor,
                models: Vec::new(),
                failure: Some(ProbeFailureKind::BadResponse),
            };
        }
    };

    match parse_model_list(kind, &body) {
        Some(models) => {
            descriptor.reachable = true;
            tracing::info!(
                runtime = kind.as_str(),
                base_url = %descriptor.base_url,
                model_count = models.len(),
                "Runtime reachable"
            );
            ProbeReport {
                descriptor,
                models,
                failure: None,
            }
        }
        None => ProbeReport {
            descriptor,
            models: Vec::new(),
            failure: Some(ProbeFailureKind::BadResponse),
        },
    }
}

/// Normalize the kind-specific JSON shape into model stubs.
fn parse_model_list(kind: RuntimeKind, body: &serde_json::Value) -> Option<Vec<ModelStub>> {
    let items = match kind {
        RuntimeKind::Ollama => body.get("models")?.as_array()?,
        _ => body.get("data")?.as_array()?,
    };

    let mut models = Vec::with_capacity(items.len());
    for item in items {
        // Ollama names the field "name"; OpenAI-compatible runtimes use "id".
        let id = item
            .get("id")
            .or_else(|| item.get("name"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if id.is_empty() {
            continue;
        }
        let display_name = item
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or(id)
            .to_string();
        models.push(ModelStub {
            id: id.to_string(),
            display_name,
            capabilities: infer_capabilities(id),
        });
    }
    Some(models)
}

/// Probe many runtimes in parallel, bounded to [`MAX_IN_FLIGHT`].
/// Result order matches input order.
pub async fn probe_all(
    client: &reqwest::Client,
    targets: Vec<(RuntimeKind, String)>,
    timeout: Duration,
    allowed_hosts: &[String],
) -> Vec<ProbeReport> {
    futures::stream::iter(targets.into_iter().map(|(kind, base_url)| {
        let client = client.clone();
        let allowed = allowed_hosts.to_vec();
        async move { probe(&client, kind, &base_url, timeout, &allowed).await }
    }))
    .buffered(MAX_IN_FLIGHT)
    .collect()
    .await
}

/// The fixed set of well-known local endpoints, one per runtime kind.
pub fn default_scan_targets() -> Vec<(RuntimeKind, String)> {
    [
        RuntimeKind::Lmstudio,
        RuntimeKind::Ollama,
        RuntimeKind::Llamacpp,
        RuntimeKind::Koboldcpp,
        RuntimeKind::Jan,
        RuntimeKind::Gpt4all,
        RuntimeKind::Vllm,
    ]
    .into_iter()
    .map(|kind| (kind, format!("http://localhost:{}", kind.default_port())))
    .collect()
}

/// Scan targets for a configuration: the well-known set plus the configured
/// primary endpoint, with disallowed hosts filtered out up front.
pub fn scan_targets(
    local_endpoint: &str,
    allowed_hosts: &[String],
) -> Vec<(RuntimeKind, String)> {
    let mut targets = default_scan_targets();

    // The configured endpoint includes the /v1 suffix; scan targets are origins.
    let origin = local_endpoint.trim_end_matches('/').trim_end_matches("/v1");
    if !targets.iter().any(|(_, url)| url == origin) {
        targets.push((RuntimeKind::GenericOpenai, origin.to_string()));
    }

    targets.retain(|(kind, url)| match check_host_allowed(url, allowed_hosts) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(runtime = kind.as_str(), url = %url, error = %e, "Dropping scan target");
            false
        }
    });
    targets
}
