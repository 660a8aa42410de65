//! Triage engine: decide which model should handle a request
//!
//! A deterministic rule layer (forced override, vision fast path, hard
//! trigger rules) followed by a delegated-classifier layer. The classifier
//! is a small local model asked to emit a JSON verdict; free-form responses
//! fall back to a textual heuristic, which materially improves robustness
//! against classifier verbosity.

use crate::config::Config;
use crate::error::AppResult;
use crate::registry::{LookupDefaults, ModelRef, RegistrySnapshot};
use serde::Serialize;
use std::time::Duration;

/// Classifier responses longer than this indicate a model ignoring its
/// instructions; they are discarded rather than parsed.
const MAX_CLASSIFIER_RESPONSE: usize = 4096;

/// Where a triage decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriageOrigin {
    HardRule,
    Classifier,
    Default,
    Forced,
}

/// The model recommendation for one request.
#[derive(Debug, Clone, Serialize)]
pub struct TriageDecision {
    #[serde(serialize_with = "serialize_ref")]
    pub preferred: ModelRef,
    pub confidence: f64,
    pub reason: String,
    pub origin: TriageOrigin,
}

fn serialize_ref<S: serde::Serializer>(r: &ModelRef, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(r.as_str())
}

/// What the triage engine needs to know about a request.
#[derive(Debug, Clone)]
pub struct TriageInput<'a> {
    pub text: &'a str,
    pub has_image: bool,
    pub forced: Option<ModelRef>,
}

/// Outcome of the delegated classifier call.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassifierVerdict {
    /// The response contained a well-formed JSON verdict
    Parsed {
        model: String,
        confidence: f64,
        reason: String,
    },
    /// No JSON, but the response text leaned one way
    Heuristic { prefers_cloud: bool },
    /// Nothing usable came back
    Failed(String),
}

pub struct TriageEngine {
    client: reqwest::Client,
}

impl TriageEngine {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Produce a decision for the request, in strict order: forced override,
    /// vision fast path, hard rules, classifier, chain default.
    pub async fn triage(
        &self,
        input: &TriageInput<'_>,
        config: &Config,
        registry: &RegistrySnapshot,
    ) -> AppResult<TriageDecision> {
        let defaults = LookupDefaults::from_config(config)?;

        // 1. Forced override: no rule evaluation at all.
        if let Some(forced) = &input.forced {
            return Ok(self.adjust_for_context(
                TriageDecision {
                    preferred: forced.clone(),
                    confidence: 1.0,
                    reason: "forced by caller".to_string(),
                    origin: TriageOrigin::Forced,
                },
                input,
                registry,
                &defaults,
            ));
        }

        // 2. Vision fast path: capability-tagged registry entries first.
        if input.has_image {
            let preferred = self.vision_ref(registry);
            return Ok(TriageDecision {
                preferred,
                confidence: 1.0,
                reason: "vision".to_string(),
                origin: TriageOrigin::HardRule,
            });
        }

        // 3. Hard rules in declaration order; first substring match wins.
        //    Matching is case-sensitive and not word-boundary-aware: the
        //    configured triggers are domain terms, often CJK.
        for rule in &config.routing.hard_rules {
            let matched = rule.triggers.is_empty()
                || rule.triggers.iter().any(|t| input.text.contains(t.as_str()));
            if matched {
                match ModelRef::parse(&rule.model) {
                    Ok(preferred) => {
                        tracing::debug!(
                            model = %preferred,
                            reason = %rule.reason,
                            "Hard rule matched"
                        );
                        return Ok(self.adjust_for_context(
                            TriageDecision {
                                preferred,
                                confidence: 1.0,
                                reason: rule.reason.clone(),
                                origin: TriageOrigin::HardRule,
                            },
                            input,
                            registry,
                            &defaults,
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(model = %rule.model, error = %e, "Skipping unparseable hard rule");
                    }
                }
            }
        }

        // 4. Soft classification via the delegated local model.
        let ir = &config.routing.intelligent_routing;
        if ir.enabled {
            match self.classify(input.text, config).await {
                ClassifierVerdict::Parsed {
                    model,
                    confidence,
                    reason,
                } => {
                    if let Some(decision) =
                        self.decision_from_verdict(&model, confidence, reason, config)
                    {
                        return Ok(self.adjust_for_context(decision, input, registry, &defaults));
                    }
                    tracing::warn!(model = %model, "Classifier named an unusable model, using default");
                }
                ClassifierVerdict::Heuristic { prefers_cloud } => {
                    let raw = if prefers_cloud { "cloud" } else { "local" };
                    let decision = TriageDecision {
                        preferred: ModelRef::parse(raw)?,
                        confidence: 0.8,
                        reason: "textual heuristic".to_string(),
                        origin: TriageOrigin::Classifier,
                    };
                    let decision = self.upgrade_low_confidence(decision, config);
                    return Ok(self.adjust_for_context(decision, input, registry, &defaults));
                }
                ClassifierVerdict::Failed(reason) => {
                    tracing::warn!(reason = %reason, "Classifier unusable, falling back to chain default");
                }
            }
        }

        // Chain default: classifier disabled, unreachable, or unusable.
        let chain = config.effective_chain();
        let primary = chain.first().cloned().unwrap_or_else(|| "local".to_string());
        Ok(self.adjust_for_context(
            TriageDecision {
                preferred: ModelRef::parse(&primary)?,
                confidence: 0.5,
                reason: "fallback chain primary".to_string(),
                origin: TriageOrigin::Default,
            },
            input,
            registry,
            &defaults,
        ))
    }

    /// Map a parsed classifier verdict onto a decision, applying the
    /// confidence-upgrade step for local recommendations.
    fn decision_from_verdict(
        &self,
        model: &str,
        confidence: f64,
        reason: String,
        config: &Config,
    ) -> Option<TriageDecision> {
        let preferred = if model.contains("cloud") {
            ModelRef::parse("cloud").ok()?
        } else if model.contains("local") {
            ModelRef::parse("local").ok()?
        } else {
            ModelRef::parse(model).ok()?
        };

        let decision = TriageDecision {
            preferred,
            confidence: confidence.clamp(0.0, 1.0),
            reason,
            origin: TriageOrigin::Classifier,
        };
        Some(self.upgrade_low_confidence(decision, config))
    }

    /// Below the configured threshold, a local recommendation is upgraded to
    /// the default cloud reference. The classifier's reason survives.
    fn upgrade_low_confidence(&self, decision: TriageDecision, config: &Config) -> TriageDecision {
        let threshold = config.routing.intelligent_routing.confidence_threshold;
        let prefers_local = matches!(
            decision.preferred.target(),
            crate::registry::RefTarget::Local
                | crate::registry::RefTarget::Exact(crate::registry::Provider::Local, _)
        );
        if prefers_local && decision.confidence < threshold {
            tracing::info!(
                confidence = decision.confidence,
                threshold,
                reason = %decision.reason,
                "Upgrading low-confidence local recommendation to cloud"
            );
            return TriageDecision {
                preferred: ModelRef::parse("cloud").expect("'cloud' always parses"),
                ..decision
            };
        }
        decision
    }

    /// Prefer a larger-context model when the input would overflow the
    /// chosen one. When nothing fits, the decision is left alone and the
    /// caller surfaces `context-too-large`.
    fn adjust_for_context(
        &self,
        decision: TriageDecision,
        input: &TriageInput<'_>,
        registry: &RegistrySnapshot,
        defaults: &LookupDefaults,
    ) -> TriageDecision {
        let estimate = estimate_tokens(input.text);
        let Some(entry) = registry.lookup(&decision.preferred, defaults) else {
            return decision;
        };
        if estimate <= u64::from(entry.context_tokens) {
            return decision;
        }
        let Some(bigger) = registry.entry_with_context(estimate) else {
            return decision;
        };
        match ModelRef::parse(&bigger.key()) {
            Ok(preferred) => {
                tracing::info!(
                    from = %decision.preferred,
                    to = %preferred,
                    estimate,
                    "Input exceeds preferred model context, upgrading"
                );
                TriageDecision {
                    preferred,
                    reason: format!("{} (context upgrade)", decision.reason),
                    ..decision
                }
            }
            Err(_) => decision,
        }
    }

    /// The vision-capable reference: a reachable capability-tagged local
    /// entry first, then a tagged cloud entry, then the default cloud model.
    fn vision_ref(&self, registry: &RegistrySnapshot) -> ModelRef {
        let local = registry
            .list_local()
            .into_iter()
            .find(|e| e.is_reachable_local() && e.capabilities.vision);
        let chosen = local.or_else(|| {
            registry
                .list_cloud()
                .into_iter()
                .find(|e| e.capabilities.vision)
        });
        match chosen {
            Some(entry) => ModelRef::parse(&entry.key())
                .unwrap_or_else(|_| ModelRef::parse("cloud").expect("'cloud' always parses")),
            None => ModelRef::parse("cloud").expect("'cloud' always parses"),
        }
    }

    /// Ask the delegated local classifier for a verdict.
    pub async fn classify(&self, text: &str, config: &Config) -> ClassifierVerdict {
        let ir = &config.routing.intelligent_routing;
        let model = match ir
            .classifier_model
            .clone()
            .or_else(|| config.models.local.model.clone())
        {
            Some(m) => m,
            None => return ClassifierVerdict::Failed("no classifier model configured".to_string()),
        };

        let prompt = ir.triage_prompt.replace("{input}", text);
        let url = format!(
            "{}/chat/completions",
            config.models.local.endpoint.trim_end_matches('/')
        );
        let body = serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
            "stream": false,
            "temperature": 0.0,
        });

        let response = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(ir.timeout_seconds))
            .json(&body)
            .send()
            .await;

        let response = match response {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                return ClassifierVerdict::Failed(format!("classifier returned HTTP {}", r.status()))
            }
            Err(e) => return ClassifierVerdict::Failed(format!("classifier unreachable: {e}")),
        };

        let body: serde_json::Value = match response.json().await {
            Ok(v) => v,
            Err(e) => return ClassifierVerdict::Failed(format!("classifier body unreadable: {e}")),
        };
        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default();
        if content.is_empty() {
            return ClassifierVerdict::Failed("classifier returned no content".to_string());
        }
        if content.len() > MAX_CLASSIFIER_RESPONSE {
            return ClassifierVerdict::Failed(format!(
                "classifier response too large ({} bytes)",
                content.len()
            ));
        }

        parse_classifier_response(content)
    }
}

/// Simple token estimate shared with the context checks: chars / 4.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64 + 3) / 4
}

/// Parse the classifier's free-form response.
///
/// First tries to extract a JSON object `{"model", "confidence", "reason"}`
/// from anywhere in the text, then falls back to scanning for the
/// cloud/complex vs local/simple tokens.
pub fn parse_classifier_response(content: &str) -> ClassifierVerdict {
    if let Some(object) = extract_json_object(content) {
        let model = object["model"].as_str().unwrap_or_default();
        if !model.is_empty() {
            return ClassifierVerdict::Parsed {
                model: model.to_string(),
                confidence: object["confidence"].as_f64().unwrap_or(0.5),
                reason: object["reason"].as_str().unwrap_or("").to_string(),
            };
        }
    }

    let lower = content.to_lowercase();
    if lower.contains("cloud") || lower.contains("complex") {
        return ClassifierVerdict::Heuristic { prefers_cloud: true };
    }
    if lower.contains("local") || lower.contains("simple") {
        return ClassifierVerdict::Heuristic {
            prefers_cloud: false,
        };
    }

    ClassifierVerdict::Failed("no JSON object and no heuristic tokens".to_string())
}

/// Extract the first balanced JSON object from free-form text.
///
/// Brace counting is string-aware so reasons containing `{` do not break
/// the scan.
fn extract_json_object(text: &str) -> Option<serde_json::Value> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start..start + offset + c.len_utf8()];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::registry::tests::{cloud_entry, local_entry};
    use crate::registry::{Provider, RegistrySnapshot};
    use std::collections::BTreeMap;
    use std::str::FromStr;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config() -> Config {
        Config::from_str(crate::config::test_config_yaml()).unwrap()
    }

    fn registry_with(entries: Vec<crate::registry::ModelEntry>) -> RegistrySnapshot {
        RegistrySnapshot {
            entries: entries.into_iter().map(|e| (e.key(), e)).collect(),
            last_scan_at: Some(chrono::Utc::now()),
            ttl_seconds: 300,
            refreshed: true,
        }
    }

    fn full_registry() -> RegistrySnapshot {
        registry_with(vec![
            local_entry("qwen3-4b", true),
            local_entry("qwen2-vl-7b", true),
            cloud_entry(Provider::Anthropic, "claude-sonnet-4-5"),
        ])
    }

    fn engine() -> TriageEngine {
        TriageEngine::new(reqwest::Client::new())
    }

    fn input(text: &str) -> TriageInput<'_> {
        TriageInput {
            text,
            has_image: false,
            forced: None,
        }
    }

    #[tokio::test]
    async fn forced_override_skips_all_rules() {
        let decision = engine()
            .triage(
                &TriageInput {
                    text: "このコスト見積もりを分析して",
                    has_image: false,
                    forced: Some(ModelRef::parse("local:qwen3-4b").unwrap()),
                },
                &config(),
                &full_registry(),
            )
            .await
            .unwrap();
        assert_eq!(decision.origin, TriageOrigin::Forced);
        assert_eq!(decision.preferred.as_str(), "local:qwen3-4b");
        assert_eq!(decision.confidence, 1.0);
    }

    #[tokio::test]
    async fn vision_prefers_tagged_local_entry() {
        let decision = engine()
            .triage(
                &TriageInput {
                    text: "what is in this picture",
                    has_image: true,
                    forced: None,
                },
                &config(),
                &full_registry(),
            )
            .await
            .unwrap();
        assert_eq!(decision.origin, TriageOrigin::HardRule);
        assert_eq!(decision.reason, "vision");
        assert_eq!(decision.preferred.as_str(), "local:qwen2-vl-7b");
    }

    #[tokio::test]
    async fn vision_falls_back_to_cloud_entry() {
        let registry = registry_with(vec![
            local_entry("qwen3-4b", true),
            cloud_entry(Provider::Anthropic, "claude-sonnet-4-5"),
        ]);
        let decision = engine()
            .triage(
                &TriageInput {
                    text: "describe",
                    has_image: true,
                    forced: None,
                },
                &config(),
                &registry,
            )
            .await
            .unwrap();
        assert_eq!(
            decision.preferred.as_str(),
            "anthropic:claude-sonnet-4-5"
        );
    }

    #[tokio::test]
    async fn hard_rule_matches_cjk_substring() {
        let mut config = config();
        config.routing.intelligent_routing.enabled = false;
        let decision = engine()
            .triage(
                &input("このコスト見積もりを分析して"),
                &config,
                &full_registry(),
            )
            .await
            .unwrap();
        assert_eq!(decision.origin, TriageOrigin::HardRule);
        assert_eq!(decision.preferred.as_str(), "cloud:claude-sonnet-4-5");
        assert_eq!(decision.confidence, 1.0);
    }

    #[tokio::test]
    async fn hard_rule_matching_is_case_sensitive() {
        let mut config = config();
        config.routing.intelligent_routing.enabled = false;
        // The configured trigger is "estimate"; "Estimate" must not match.
        let decision = engine()
            .triage(&input("Estimate the cost"), &config, &full_registry())
            .await
            .unwrap();
        assert_eq!(decision.origin, TriageOrigin::Default);
    }

    #[tokio::test]
    async fn first_matching_rule_wins() {
        let mut config = config();
        config.routing.intelligent_routing.enabled = false;
        config.routing.hard_rules.push(crate::config::HardRule {
            triggers: vec!["estimate".to_string()],
            model: "local".to_string(),
            reason: "later rule".to_string(),
        });
        let decision = engine()
            .triage(&input("estimate this"), &config, &full_registry())
            .await
            .unwrap();
        // The earlier rule also names "estimate" and wins by order.
        assert_eq!(decision.preferred.as_str(), "cloud:claude-sonnet-4-5");
    }

    #[tokio::test]
    async fn empty_trigger_list_matches_everything() {
        let mut config = config();
        config.routing.intelligent_routing.enabled = false;
        config.routing.hard_rules.insert(
            0,
            crate::config::HardRule {
                triggers: vec![],
                model: "local".to_string(),
                reason: "catch-all".to_string(),
            },
        );
        let decision = engine()
            .triage(&input("anything at all"), &config, &full_registry())
            .await
            .unwrap();
        assert_eq!(decision.preferred.as_str(), "local");
        assert_eq!(decision.reason, "catch-all");
    }

    #[tokio::test]
    async fn default_when_classifier_disabled() {
        let mut config = config();
        config.routing.intelligent_routing.enabled = false;
        let decision = engine()
            .triage(&input("ordinary question"), &config, &full_registry())
            .await
            .unwrap();
        assert_eq!(decision.origin, TriageOrigin::Default);
        assert_eq!(decision.preferred.as_str(), "local");
        assert_eq!(decision.confidence, 0.5);
    }

    #[tokio::test]
    async fn default_when_classifier_unreachable() {
        let mut config = config();
        // Nothing listens here, so the classifier call fails fast.
        config.models.local.endpoint = "http://127.0.0.1:19997/v1".to_string();
        let decision = engine()
            .triage(&input("ordinary question"), &config, &full_registry())
            .await
            .unwrap();
        assert_eq!(decision.origin, TriageOrigin::Default);
    }

    #[tokio::test]
    async fn triage_is_deterministic_without_classifier() {
        let mut config = config();
        config.routing.intelligent_routing.enabled = false;
        let registry = full_registry();
        let first = engine()
            .triage(&input("same input"), &config, &registry)
            .await
            .unwrap();
        for _ in 0..5 {
            let again = engine()
                .triage(&input("same input"), &config, &registry)
                .await
                .unwrap();
            assert_eq!(again.preferred.as_str(), first.preferred.as_str());
            assert_eq!(again.origin, first.origin);
            assert_eq!(again.confidence, first.confidence);
        }
    }

    #[tokio::test]
    async fn classifier_json_verdict_is_used() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content":
                    "Sure! {\"model\": \"local\", \"confidence\": 0.9, \"reason\": \"simple lookup\"}"}}]
            })))
            .mount(&server)
            .await;

        let mut config = config();
        config.models.local.endpoint = format!("{}/v1", server.uri());
        let decision = engine()
            .triage(&input("ordinary question"), &config, &full_registry())
            .await
            .unwrap();
        assert_eq!(decision.origin, TriageOrigin::Classifier);
        assert_eq!(decision.preferred.as_str(), "local");
        assert_eq!(decision.confidence, 0.9);
        assert_eq!(decision.reason, "simple lookup");
    }

    #[tokio::test]
    async fn low_confidence_local_upgrades_to_cloud() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content":
                    "{\"model\": \"local\", \"confidence\": 0.6, \"reason\": \"simple\"}"}}]
            })))
            .mount(&server)
            .await;

        let mut config = config();
        config.models.local.endpoint = format!("{}/v1", server.uri());
        // threshold is 0.75 in the test config
        let decision = engine()
            .triage(&input("borderline question"), &config, &full_registry())
            .await
            .unwrap();
        assert_eq!(decision.origin, TriageOrigin::Classifier);
        assert_eq!(decision.preferred.as_str(), "cloud");
        // The classifier's reason is preserved through the upgrade.
        assert_eq!(decision.reason, "simple");
        assert_eq!(decision.confidence, 0.6);
    }

    #[tokio::test]
    async fn verbose_classifier_falls_back_to_heuristic() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content":
                    "This looks quite complex, I would send it to the cloud model."}}]
            })))
            .mount(&server)
            .await;

        let mut config = config();
        config.models.local.endpoint = format!("{}/v1", server.uri());
        let decision = engine()
            .triage(&input("hmm"), &config, &full_registry())
            .await
            .unwrap();
        assert_eq!(decision.origin, TriageOrigin::Classifier);
        assert_eq!(decision.preferred.as_str(), "cloud");
        assert_eq!(decision.confidence, 0.8);
    }

    #[test]
    fn json_extraction_handles_surrounding_prose() {
        let verdict = parse_classifier_response(
            "Here is my verdict:\n```json\n{\"model\": \"cloud\", \"confidence\": 0.95, \"reason\": \"multi-step {nested} analysis\"}\n```\nHope that helps!",
        );
        assert_eq!(
            verdict,
            ClassifierVerdict::Parsed {
                model: "cloud".to_string(),
                confidence: 0.95,
                reason: "multi-step {nested} analysis".to_string(),
            }
        );
    }

    #[test]
    fn heuristic_tokens_decide_when_json_absent() {
        assert_eq!(
            parse_classifier_response("definitely a complex one"),
            ClassifierVerdict::Heuristic { prefers_cloud: true }
        );
        assert_eq!(
            parse_classifier_response("keep it local"),
            ClassifierVerdict::Heuristic {
                prefers_cloud: false
            }
        );
        assert!(matches!(
            parse_classifier_response("42"),
            ClassifierVerdict::Failed(_)
        ));
    }

    #[tokio::test]
    async fn oversized_input_upgrades_to_larger_context() {
        let mut config = config();
        config.routing.intelligent_routing.enabled = false;
        // ~40k tokens, over the 8192 local context but under the cloud one
        let long_input = "a".repeat(160_000);
        let decision = engine()
            .triage(&input(&long_input), &config, &full_registry())
            .await
            .unwrap();
        assert_eq!(decision.preferred.as_str(), "anthropic:claude-sonnet-4-5");
        assert!(decision.reason.contains("context upgrade"));
    }

    #[test]
    fn token_estimate_is_chars_over_four() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens(&"a".repeat(1000)), 250);
    }
}
