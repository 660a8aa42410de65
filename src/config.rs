//! Configuration management for Thriftroute
//!
//! Parses YAML configuration files and provides typed access to routing
//! rules, pricing, the fallback chain, and timeouts. Validation failures are
//! terminal at load time; questionable-but-legal settings only warn.

use crate::error::{AppResult, RouterError};
use crate::registry::{ModelRef, Provider, RefTarget};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub models: ModelsConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub cost: CostConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_seconds: default_request_timeout(),
            max_concurrent_requests: default_max_concurrent(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_request_timeout() -> u64 {
    120
}

fn default_max_concurrent() -> usize {
    16
}

/// Default local and cloud model configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelsConfig {
    pub local: LocalModelConfig,
    pub cloud: CloudModelConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalModelConfig {
    /// Default URL for the primary local runtime
    #[serde(default = "default_local_endpoint")]
    pub endpoint: String,
    /// Preferred local model id when more than one is loaded
    #[serde(default)]
    pub model: Option<String>,
}

fn default_local_endpoint() -> String {
    "http://localhost:1234/v1".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CloudModelConfig {
    /// Default cloud provider (anthropic, openai, ...)
    pub provider: String,
    /// Default cloud model id
    pub model: String,
}

/// Routing configuration: ordered hard rules plus the delegated classifier
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub hard_rules: Vec<HardRule>,
    #[serde(default)]
    pub intelligent_routing: IntelligentRouting,
}

/// One deterministic trigger-substring rule.
///
/// The first rule whose trigger list has any substring contained in the
/// input wins; iteration order is declaration order. An empty trigger list
/// makes the rule unconditional (accepted with a warning).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HardRule {
    #[serde(default)]
    pub triggers: Vec<String>,
    pub model: String,
    #[serde(default)]
    pub reason: String,
}

/// Delegated-classifier settings for the soft rule layer
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IntelligentRouting {
    #[serde(default)]
    pub enabled: bool,
    /// Below this confidence on a local recommendation, upgrade to cloud
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// Template with an `{input}` placeholder
    #[serde(default = "default_triage_prompt")]
    pub triage_prompt: String,
    /// Which local model to ask; falls back to `models.local.model`
    #[serde(default)]
    pub classifier_model: Option<String>,
    #[serde(default = "default_classifier_timeout")]
    pub timeout_seconds: u64,
}

impl Default for IntelligentRouting {
    fn default() -> Self {
        Self {
            enabled: false,
            confidence_threshold: default_confidence_threshold(),
            triage_prompt: default_triage_prompt(),
            classifier_model: None,
            timeout_seconds: default_classifier_timeout(),
        }
    }
}

fn default_confidence_threshold() -> f64 {
    0.75
}

fn default_classifier_timeout() -> u64 {
    10
}

fn default_triage_prompt() -> String {
    "You are a request triage assistant. Classify the following request and \
     answer with a JSON object {\"model\": \"local\" or \"cloud\", \
     \"confidence\": 0.0-1.0, \"reason\": \"...\"}.\n\nRequest:\n{input}"
        .to_string()
}

/// Ordered fallback chain; first element is the default primary
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FallbackConfig {
    pub chain: Vec<String>,
}

/// Pricing table and display currency multiplier
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CostConfig {
    /// Price per million tokens, keyed by model id
    #[serde(default)]
    pub pricing: std::collections::BTreeMap<String, ModelPricing>,
    #[serde(default = "default_fx_rate")]
    pub fx_rate: f64,
}

fn default_fx_rate() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
}

/// Runtime scanner settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScannerConfig {
    /// Registry refresh interval in seconds
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_seconds: u64,
    /// Extra hostnames admitted past the loopback-only scan guard
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            cache_ttl: default_cache_ttl(),
            probe_timeout_seconds: default_probe_timeout(),
            allowed_hosts: Vec::new(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_probe_timeout() -> u64 {
    3
}

/// Conversation store location
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/conversations.db")
}

/// Per-attempt retry policy
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            exponential_base: default_exponential_base(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_exponential_base() -> f64 {
    2.0
}

impl Config {
    /// Load configuration from a YAML file, apply environment overrides,
    /// and validate.
    pub fn from_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            RouterError::Config(format!(
                "Failed to read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let mut config = Self::from_str(&content).map_err(|e| {
            RouterError::Config(format!(
                "Failed to parse config file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment variables that override file settings.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("ROUTER_API_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("ROUTER_API_PORT") {
            match port.parse::<u16>() {
                Ok(p) => self.server.port = p,
                Err(_) => tracing::warn!(value = %port, "Ignoring non-numeric ROUTER_API_PORT"),
            }
        }
        if let Ok(path) = std::env::var("ROUTER_STORAGE_PATH") {
            self.database.path = PathBuf::from(path);
        }
    }

    /// Directory holding the store, registry snapshot, and operator files.
    pub fn data_dir(&self) -> PathBuf {
        self.database
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("data"))
    }

    /// Path of the persisted registry snapshot.
    pub fn registry_snapshot_path(&self) -> PathBuf {
        self.data_dir().join("model_registry.json")
    }

    /// The fallback chain, honoring the operator-edited
    /// `fallback_priority.json` override when one exists in the data
    /// directory.
    pub fn effective_chain(&self) -> Vec<String> {
        let override_path = self.data_dir().join("fallback_priority.json");
        if let Ok(content) = std::fs::read_to_string(&override_path) {
            #[derive(Deserialize)]
            struct Override {
                priority: Vec<String>,
            }
            match serde_json::from_str::<Override>(&content) {
                Ok(ov) if !ov.priority.is_empty() => {
                    tracing::info!(
                        path = %override_path.display(),
                        chain = ?ov.priority,
                        "Using operator fallback priority override"
                    );
                    return ov.priority;
                }
                Ok(_) => {
                    tracing::warn!(
                        path = %override_path.display(),
                        "Fallback override has an empty priority list, ignoring"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        path = %override_path.display(),
                        error = %e,
                        "Fallback override is not valid JSON, ignoring"
                    );
                }
            }
        }
        self.fallback.chain.clone()
    }

    /// The default cloud provider/model pair as a typed reference.
    pub fn default_cloud(&self) -> AppResult<(Provider, String)> {
        let provider = Provider::from_str(&self.models.cloud.provider).map_err(|_| {
            RouterError::Config(format!(
                "Unknown cloud provider '{}'. Expected one of: anthropic, openai, google, openrouter, moonshot.",
                self.models.cloud.provider
            ))
        })?;
        Ok((provider, self.models.cloud.model.clone()))
    }

    /// Pricing for a model id, if configured.
    pub fn pricing_for(&self, model_id: &str) -> Option<ModelPricing> {
        self.cost.pricing.get(model_id).copied()
    }

    /// Validate configuration after parsing.
    ///
    /// Hard failures are things that cannot work even in principle; odd but
    /// legal settings (empty trigger lists, pricing for unknown models) only
    /// warn so operators can converge incrementally.
    pub fn validate(&self) -> AppResult<()> {
        // Default cloud provider must be a known provider
        let (cloud_provider, _) = self.default_cloud()?;
        if cloud_provider == Provider::Local {
            return Err(RouterError::Config(
                "models.cloud.provider cannot be 'local'".to_string(),
            ));
        }

        if !self.models.local.endpoint.starts_with("http://")
            && !self.models.local.endpoint.starts_with("https://")
        {
            return Err(RouterError::Config(format!(
                "models.local.endpoint '{}' must start with http:// or https://",
                self.models.local.endpoint
            )));
        }

        // Fallback chain: non-empty, every reference parseable
        if self.fallback.chain.is_empty() {
            return Err(RouterError::Config(
                "fallback.chain must contain at least one model reference".to_string(),
            ));
        }
        for reference in &self.fallback.chain {
            ModelRef::parse(reference).map_err(|e| {
                RouterError::Config(format!(
                    "fallback.chain entry '{reference}' is not a valid model reference: {e}"
                ))
            })?;
        }

        // Hard rules: references parseable, empty trigger lists warned
        for (index, rule) in self.routing.hard_rules.iter().enumerate() {
            ModelRef::parse(&rule.model).map_err(|e| {
                RouterError::Config(format!(
                    "routing.hard_rules[{index}].model '{}' is not a valid model reference: {e}",
                    rule.model
                ))
            })?;
            if rule.triggers.is_empty() {
                tracing::warn!(
                    rule_index = index,
                    model = %rule.model,
                    "Hard rule has an empty trigger list and will match every request"
                );
            }
        }

        // Intelligent routing sanity
        let ir = &self.routing.intelligent_routing;
        if !(0.0..=1.0).contains(&ir.confidence_threshold) {
            return Err(RouterError::Config(format!(
                "routing.intelligent_routing.confidence_threshold must be within [0, 1], got {}",
                ir.confidence_threshold
            )));
        }
        if ir.enabled && !ir.triage_prompt.contains("{input}") {
            return Err(RouterError::Config(
                "routing.intelligent_routing.triage_prompt must contain an {input} placeholder"
                    .to_string(),
            ));
        }

        // Cost table sanity
        if self.cost.fx_rate <= 0.0 || !self.cost.fx_rate.is_finite() {
            return Err(RouterError::Config(format!(
                "cost.fx_rate must be a positive finite number, got {}",
                self.cost.fx_rate
            )));
        }
        for (model, pricing) in &self.cost.pricing {
            if pricing.input < 0.0 || pricing.output < 0.0 {
                return Err(RouterError::Config(format!(
                    "cost.pricing.{model} has negative prices"
                )));
            }
            if !self.model_is_referenced(model) {
                tracing::warn!(
                    model = %model,
                    "Pricing entry refers to a model no configured reference names"
                );
            }
        }

        // Retry policy sanity
        if self.retry.max_attempts == 0 {
            return Err(RouterError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.exponential_base < 1.0 {
            return Err(RouterError::Config(format!(
                "retry.exponential_base must be >= 1.0, got {}",
                self.retry.exponential_base
            )));
        }

        if self.scanner.cache_ttl == 0 {
            return Err(RouterError::Config(
                "scanner.cache_ttl must be at least 1 second".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether any configured reference (chain, hard rule, defaults) could
    /// name this model id.
    fn model_is_referenced(&self, model_id: &str) -> bool {
        if self.models.cloud.model == model_id {
            return true;
        }
        if self.models.local.model.as_deref() == Some(model_id) {
            return true;
        }
        let named_by = |reference: &str| match ModelRef::parse(reference) {
            Ok(r) => match r.target() {
                RefTarget::Cloud(id) | RefTarget::Exact(_, id) => id == model_id,
                _ => false,
            },
            Err(_) => false,
        };
        self.fallback.chain.iter().any(|r| named_by(r))
            || self.routing.hard_rules.iter().any(|r| named_by(&r.model))
    }
}

impl FromStr for Config {
    type Err = RouterError;

    fn from_str(yaml: &str) -> Result<Self, Self::Err> {
        serde_yaml::from_str(yaml).map_err(|e| RouterError::Config(format!("Invalid YAML: {e}")))
    }
}

#[cfg(test)]
pub(crate) fn test_config_yaml() -> &'static str {
    r#"
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
    - triggers: ["見積", "estimate"]
      model: "cloud:claude-sonnet-4-5"
      reason: "cost estimates need the stronger model"
  intelligent_routing:
    enabled: true
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

scanner:
  cache_ttl: 300

database:
  path: "data/conversations.db"
"#
}
