//! Fallback executor: drive the priority chain
//!
//! Executes the request against the preferred backend and, on failure,
//! walks the configured chain. Transient failures are retried within a
//! candidate with exponential backoff and jitter; rate-limit responses
//! override the computed delay with the server's advertised one.
//!
//! Attempt bookkeeping: a candidate that ultimately fails contributes one
//! terminal record (its transient retries folded into the message); a
//! candidate that recovers contributes its transient records plus the
//! success record, so delay-controlled retries stay visible in the outcome.

use crate::backends::{self, Completion, GenerateRequest};
use crate::config::Config;
use crate::error::{ErrorKind, RouterError};
use crate::registry::{LookupDefaults, ModelRef, Provider, RefTarget, RegistrySnapshot};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Outcome of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptOutcome {
    Success,
    TransientFailure,
    TerminalFailure,
    /// The reference did not resolve against the registry
    Skipped,
}

/// One execution attempt against one backend.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub model_ref: String,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
}

impl AttemptRecord {
    fn failure(
        model_ref: &ModelRef,
        started_at: DateTime<Utc>,
        outcome: AttemptOutcome,
        kind: Option<ErrorKind>,
        error: String,
    ) -> Self {
        let elapsed = Utc::now()
            .signed_duration_since(started_at)
            .num_milliseconds()
            .max(0) as u64;
        Self {
            model_ref: model_ref.as_str().to_string(),
            started_at,
            elapsed_ms: elapsed,
            outcome,
            error_kind: kind,
            error: Some(error),
            tokens_in: 0,
            tokens_out: 0,
            cost: 0.0,
        }
    }
}

/// What the facade gets back: the winning response (if any) plus the full
/// attempt history.
#[derive(Debug, Clone, Serialize)]
pub struct RequestOutcome {
    pub model_ref: Option<String>,
    pub response: Option<Completion>,
    pub attempts: Vec<AttemptRecord>,
    /// True iff a local-preferred request was served by a cloud backend
    /// after at least one failure.
    pub cost_warning: bool,
    /// Set by the facade when persisting the exchange failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_warning: Option<String>,
}

impl RequestOutcome {
    pub fn succeeded(&self) -> bool {
        self.model_ref.is_some()
    }

    pub fn deadline_exceeded(&self) -> bool {
        self.attempts
            .last()
            .map(|a| a.error_kind == Some(ErrorKind::DeadlineExceeded))
            .unwrap_or(false)
    }

    /// Whether the chain stepped past at least one failed candidate.
    pub fn fell_back(&self) -> bool {
        self.succeeded()
            && self
                .attempts
                .iter()
                .any(|a| matches!(a.outcome, AttemptOutcome::TerminalFailure | AttemptOutcome::TransientFailure | AttemptOutcome::Skipped))
    }

    /// Every failure, formatted for the all-backends-failed surface.
    /// Both the primary's and each fallback's error are retained.
    pub fn failure_summaries(&self) -> Vec<String> {
        self.attempts
            .iter()
            .filter(|a| a.outcome != AttemptOutcome::Success)
            .map(|a| {
                format!(
                    "{} ({}): {}",
                    a.model_ref,
                    a.error_kind.map(|k| k.as_str()).unwrap_or("skipped"),
                    a.error.as_deref().unwrap_or("no detail")
                )
            })
            .collect()
    }
}

pub struct FallbackExecutor {
    client: reqwest::Client,
}

impl FallbackExecutor {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Build the try order: the preferred reference first, then the chain
    /// minus the preferred.
    pub fn try_order(preferred: &ModelRef, chain: &[ModelRef]) -> Vec<ModelRef> {
        let mut order = vec![preferred.clone()];
        for reference in chain {
            if reference != preferred {
                order.push(reference.clone());
            }
        }
        order
    }

    /// Execute the request, walking the chain until a candidate succeeds or
    /// everything is exhausted. Never returns an error: failures are data
    /// in the outcome, which the facade turns into a caller-visible error.
    pub async fn execute(
        &self,
        request: &GenerateRequest,
        preferred: &ModelRef,
        config: &Config,
        registry: &RegistrySnapshot,
        deadline: Instant,
    ) -> RequestOutcome {
        let defaults = match LookupDefaults::from_config(config) {
            Ok(d) => d,
            Err(e) => {
                return RequestOutcome {
                    model_ref: None,
                    response: None,
                    attempts: vec![AttemptRecord::failure(
                        preferred,
                        Utc::now(),
                        AttemptOutcome::TerminalFailure,
                        Some(ErrorKind::ConfigInvalid),
                        e.to_string(),
                    )],
                    cost_warning: false,
                    store_warning: None,
                }
            }
        };

        let chain: Vec<ModelRef> = config
            .effective_chain()
            .iter()
            .filter_map(|raw| ModelRef::parse(raw).ok())
            .collect();
        let order = Self::try_order(preferred, &chain);
        let preferred_is_local = prefers_local(preferred);

        let mut attempts: Vec<AttemptRecord> = Vec::new();

        for reference in &order {
            let Some(entry) = registry.lookup(reference, &defaults) else {
                tracing::warn!(model_ref = %reference, "Reference does not resolve, skipping chain step");
                attempts.push(AttemptRecord::failure(
                    reference,
                    Utc::now(),
                    AttemptOutcome::Skipped,
                    None,
                    "reference does not resolve against the registry".to_string(),
                ));
                continue;
            };

            let backend = match backends::backend_for(entry, &self.client) {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(model_ref = %reference, error = %e, "Cannot construct backend");
                    attempts.push(AttemptRecord::failure(
                        reference,
                        Utc::now(),
                        AttemptOutcome::TerminalFailure,
                        e.kind(),
                        e.to_string(),
                    ));
                    continue;
                }
            };

            match self
                .run_candidate(
                    request,
                    reference,
                    entry,
                    backend.as_ref(),
                    config,
                    &defaults,
                    deadline,
                    &mut attempts,
                )
                .await
            {
                CandidateResult::Success(completion, record) => {
                    let previous_failure = attempts
                        .iter()
                        .any(|a| a.outcome != AttemptOutcome::Success);
                    let cost_warning =
                        previous_failure && preferred_is_local && entry.provider.is_cloud();
                    if cost_warning {
                        tracing::warn!(
                            model_ref = %reference,
                            cost = completion.cost,
                            "Local-first request fell back to a paid cloud backend"
                        );
                    }
                    attempts.push(record);
                    return RequestOutcome {
                        model_ref: Some(reference.as_str().to_string()),
                        response: Some(completion),
                        attempts,
                        cost_warning,
                        store_warning: None,
                    };
                }
                CandidateResult::Failed => continue,
                CandidateResult::DeadlineExceeded => {
                    return RequestOutcome {
                        model_ref: None,
                        response: None,
                        attempts,
                        cost_warning: false,
                        store_warning: None,
                    }
                }
            }
        }

        RequestOutcome {
            model_ref: None,
            response: None,
            attempts,
            cost_warning: false,
            store_warning: None,
        }
    }

    /// Run the retry loop against one resolved candidate.
    ///
    /// Transient retries that end in terminal failure fold into a single
    /// terminal record; retries that end in success leave their transient
    /// records in place.
    #[allow(clippy::too_many_arguments)]
    async fn run_candidate(
        &self,
        request: &GenerateRequest,
        reference: &ModelRef,
        entry: &crate::registry::ModelEntry,
        backend: &dyn backends::Backend,
        config: &Config,
        defaults: &LookupDefaults,
        deadline: Instant,
        attempts: &mut Vec<AttemptRecord>,
    ) -> CandidateResult {
        let policy = &config.retry;
        let candidate_started = Utc::now();
        let mut transient_records: Vec<AttemptRecord> = Vec::new();
        let mut seen_malformed = false;

        for attempt in 1..=policy.max_attempts {
            let started_at = Utc::now();
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                attempts.push(AttemptRecord::failure(
                    reference,
                    candidate_started,
                    AttemptOutcome::TerminalFailure,
                    Some(ErrorKind::DeadlineExceeded),
                    "request deadline exceeded before the attempt could start".to_string(),
                ));
                return CandidateResult::DeadlineExceeded;
            }

            let result = tokio::time::timeout(remaining, backend.generate(request)).await;

            let error = match result {
                Err(_) => {
                    // The in-flight HTTP call is dropped, which aborts it.
                    tracing::warn!(
                        model_ref = %reference,
                        attempt,
                        "Deadline exceeded mid-attempt, cancelling request"
                    );
                    attempts.push(AttemptRecord::failure(
                        reference,
                        started_at,
                        AttemptOutcome::TerminalFailure,
                        Some(ErrorKind::DeadlineExceeded),
                        format!("deadline exceeded during attempt {attempt}"),
                    ));
                    return CandidateResult::DeadlineExceeded;
                }
                Ok(Ok(raw)) => {
                    let pricing = default_cloud_pricing(config, defaults);
                    let completion =
                        backends::finalize(entry, backend, request, raw, config, pricing);
                    tracing::info!(
                        model_ref = %reference,
                        attempt,
                        tokens_in = completion.tokens_in,
                        tokens_out = completion.tokens_out,
                        cost = completion.cost,
                        "Backend call succeeded"
                    );
                    attempts.append(&mut transient_records);
                    let elapsed = Utc::now()
                        .signed_duration_since(started_at)
                        .num_milliseconds()
                        .max(0) as u64;
                    let record = AttemptRecord {
                        model_ref: reference.as_str().to_string(),
                        started_at,
                        elapsed_ms: elapsed,
                        outcome: AttemptOutcome::Success,
                        error_kind: None,
                        error: None,
                        tokens_in: completion.tokens_in,
                        tokens_out: completion.tokens_out,
                        cost: completion.cost,
                    };
                    return CandidateResult::Success(completion, record);
                }
                Ok(Err(e)) => e,
            };

            let kind = error.kind().unwrap_or(ErrorKind::ConnectionRefused);

            // A malformed body is transient on the first sighting, terminal
            // thereafter.
            let retryable = if kind == ErrorKind::MalformedResponse {
                let first = !seen_malformed;
                seen_malformed = true;
                first
            } else {
                kind.is_retryable()
            };

            if !retryable || attempt == policy.max_attempts {
                let folded = transient_records.len();
                let detail = if folded > 0 {
                    format!("{error} (after {} transient failures)", folded)
                } else {
                    error.to_string()
                };
                tracing::warn!(
                    model_ref = %reference,
                    attempt,
                    kind = kind.as_str(),
                    error = %error,
                    "Candidate failed terminally, stepping to next chain entry"
                );
                attempts.push(AttemptRecord::failure(
                    reference,
                    candidate_started,
                    AttemptOutcome::TerminalFailure,
                    Some(kind),
                    detail,
                ));
                return CandidateResult::Failed;
            }

            // Transient: remember the attempt, wait, and go again. The
            // record only surfaces if this candidate eventually succeeds.
            transient_records.push(AttemptRecord::failure(
                reference,
                started_at,
                AttemptOutcome::TransientFailure,
                Some(kind),
                error.to_string(),
            ));

            let delay = error
                .retry_after()
                .unwrap_or_else(|| backoff_delay(policy, attempt - 1));
            tracing::info!(
                model_ref = %reference,
                attempt,
                delay_ms = delay.as_millis() as u64,
                kind = kind.as_str(),
                "Transient failure, retrying after delay"
            );

            let remaining = deadline.saturating_duration_since(Instant::now());
            if delay >= remaining {
                attempts.push(AttemptRecord::failure(
                    reference,
                    candidate_started,
                    AttemptOutcome::TerminalFailure,
                    Some(ErrorKind::DeadlineExceeded),
                    "retry delay would exceed the request deadline".to_string(),
                ));
                return CandidateResult::DeadlineExceeded;
            }
            tokio::time::sleep(delay).await;
        }

        unreachable!("loop exits via success, terminal failure, or deadline")
    }
}

enum CandidateResult {
    Success(Completion, AttemptRecord),
    Failed,
    DeadlineExceeded,
}

fn prefers_local(reference: &ModelRef) -> bool {
    matches!(
        reference.target(),
        RefTarget::Local | RefTarget::Exact(Provider::Local, _)
    )
}

/// Pricing of the configured default cloud model, for the savings figure.
fn default_cloud_pricing(config: &Config, defaults: &LookupDefaults) -> crate::config::ModelPricing {
    config
        .pricing_for(&defaults.default_cloud_model)
        .unwrap_or_else(|| defaults.default_cloud_provider.default_pricing())
}

/// `min(baseDelay × base^attempt, maxDelay)` with ±25% jitter.
pub fn backoff_delay(policy: &crate::config::RetryConfig, attempt: u32) -> Duration {
    let exp = policy.exponential_base.powi(attempt as i32);
    let ms = (policy.base_delay_ms as f64 * exp).min(policy.max_delay_ms as f64);
    let jitter = rand::thread_rng().gen_range(0.75..1.25);
    Duration::from_millis((ms * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, RetryConfig};
    use crate::registry::tests::{cloud_entry, local_entry};
    use crate::registry::RegistrySnapshot;
    use serde_json::json;
    use std::str::FromStr;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config() -> Config {
        let mut c = Config::from_str(crate::config::test_config_yaml()).unwrap();
        // Keep unit tests fast
        c.retry.base_delay_ms = 10;
        c.retry.max_delay_ms = 50;
        c.database.path = "/nonexistent-thriftroute/conversations.db".into();
        c
    }

    fn registry_with(entries: Vec<crate::registry::ModelEntry>) -> RegistrySnapshot {
        RegistrySnapshot {
            entries: entries.into_iter().map(|e| (e.key(), e)).collect(),
            last_scan_at: Some(Utc::now()),
            ttl_seconds: 300,
            refreshed: true,
        }
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    fn local_entry_at(server: &MockServer, id: &str) -> crate::registry::ModelEntry {
        let mut entry = local_entry(id, true);
        entry.runtime.as_mut().unwrap().base_url = server.uri();
        entry
    }

    #[test]
    fn try_order_puts_preferred_first_without_duplicates() {
        let preferred = ModelRef::parse("cloud").unwrap();
        let chain = vec![
            ModelRef::parse("local").unwrap(),
            ModelRef::parse("cloud").unwrap(),
        ];
        let order = FallbackExecutor::try_order(&preferred, &chain);
        let raw: Vec<&str> = order.iter().map(|r| r.as_str()).collect();
        assert_eq!(raw, vec!["cloud", "local"]);
    }

    #[test]
    fn backoff_grows_exponentially_with_jitter_bounds() {
        let policy = RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            exponential_base: 2.0,
        };
        for attempt in 0..4 {
            let expected = 1000.0 * 2f64.powi(attempt as i32);
            let expected = expected.min(30_000.0);
            for _ in 0..20 {
                let d = backoff_delay(&policy, attempt).as_millis() as f64;
                assert!(d >= expected * 0.75 - 1.0, "attempt {attempt}: {d} too small");
                assert!(d <= expected * 1.25 + 1.0, "attempt {attempt}: {d} too large");
            }
        }
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let policy = RetryConfig {
            max_attempts: 10,
            base_delay_ms: 1000,
            max_delay_ms: 5000,
            exponential_base: 2.0,
        };
        for _ in 0..20 {
            let d = backoff_delay(&policy, 9).as_millis() as f64;
            assert!(d <= 5000.0 * 1.25 + 1.0);
        }
    }

    #[tokio::test]
    async fn unresolved_reference_is_skipped_with_record() {
        let executor = FallbackExecutor::new(reqwest::Client::new());
        let registry = registry_with(vec![]); // nothing resolves
        let outcome = executor
            .execute(
                &GenerateRequest::new("hi"),
                &ModelRef::parse("local").unwrap(),
                &config(),
                &registry,
                far_deadline(),
            )
            .await;

        assert!(!outcome.succeeded());
        // preferred "local" skipped; chain "local" deduped; chain "cloud" skipped
        assert_eq!(outcome.attempts.len(), 2);
        assert!(outcome
            .attempts
            .iter()
            .all(|a| a.outcome == AttemptOutcome::Skipped));
    }

    #[tokio::test]
    async fn success_on_first_candidate_records_one_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "hello"}}],
                "usage": {"prompt_tokens": 3, "completion_tokens": 2}
            })))
            .mount(&server)
            .await;

        let executor = FallbackExecutor::new(reqwest::Client::new());
        let registry = registry_with(vec![local_entry_at(&server, "qwen3-4b")]);
        let outcome = executor
            .execute(
                &GenerateRequest::new("hi"),
                &ModelRef::parse("local").unwrap(),
                &config(),
                &registry,
                far_deadline(),
            )
            .await;

        assert!(outcome.succeeded());
        assert_eq!(outcome.model_ref.as_deref(), Some("local"));
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(outcome.attempts[0].outcome, AttemptOutcome::Success);
        assert!(!outcome.cost_warning);
        assert!(!outcome.fell_back());
        let completion = outcome.response.unwrap();
        assert_eq!(completion.text, "hello");
        assert_eq!(completion.cost, 0.0);
        assert!(completion.saved_cost > 0.0);
    }

    #[tokio::test]
    async fn malformed_body_is_transient_once_then_terminal() {
        let server = MockServer::start().await;
        // Every response is 200 with an unusable body.
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .expect(2) // first sighting retries once, second is terminal
            .mount(&server)
            .await;

        let executor = FallbackExecutor::new(reqwest::Client::new());
        let registry = registry_with(vec![local_entry_at(&server, "qwen3-4b")]);
        let mut config = config();
        config.fallback.chain = vec!["local".to_string()];
        let outcome = executor
            .execute(
                &GenerateRequest::new("hi"),
                &ModelRef::parse("local").unwrap(),
                &config,
                &registry,
                far_deadline(),
            )
            .await;

        assert!(!outcome.succeeded());
        let last = outcome.attempts.last().unwrap();
        assert_eq!(last.outcome, AttemptOutcome::TerminalFailure);
        assert_eq!(last.error_kind, Some(ErrorKind::MalformedResponse));
    }

    #[tokio::test]
    async fn terminal_auth_failure_does_not_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_string("no"))
            .expect(1) // exactly one call: no retry on auth errors
            .mount(&server)
            .await;

        let executor = FallbackExecutor::new(reqwest::Client::new());
        let registry = registry_with(vec![local_entry_at(&server, "qwen3-4b")]);
        let mut config = config();
        config.fallback.chain = vec!["local".to_string()];
        let outcome = executor
            .execute(
                &GenerateRequest::new("hi"),
                &ModelRef::parse("local").unwrap(),
                &config,
                &registry,
                far_deadline(),
            )
            .await;

        assert!(!outcome.succeeded());
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(outcome.attempts[0].error_kind, Some(ErrorKind::Auth));
    }

    #[tokio::test]
    async fn transient_retries_fold_into_terminal_record() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(3) // max_attempts
            .mount(&server)
            .await;

        let executor = FallbackExecutor::new(reqwest::Client::new());
        let registry = registry_with(vec![local_entry_at(&server, "qwen3-4b")]);
        let mut config = config();
        config.fallback.chain = vec!["local".to_string()];
        let outcome = executor
            .execute(
                &GenerateRequest::new("hi"),
                &ModelRef::parse("local").unwrap(),
                &config,
                &registry,
                far_deadline(),
            )
            .await;

        assert!(!outcome.succeeded());
        // One folded terminal record, not three.
        assert_eq!(outcome.attempts.len(), 1);
        let record = &outcome.attempts[0];
        assert_eq!(record.outcome, AttemptOutcome::TerminalFailure);
        assert_eq!(record.error_kind, Some(ErrorKind::Http5xx));
        assert!(record.error.as_deref().unwrap().contains("2 transient failures"));
        // Invariant: a failed outcome contains only terminal attempts.
        assert!(outcome
            .attempts
            .iter()
            .all(|a| a.outcome == AttemptOutcome::TerminalFailure));
    }

    #[tokio::test]
    async fn deadline_cancels_retry_loop() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(30))
                    .set_body_json(json!({"choices": [{"message": {"content": "late"}}]})),
            )
            .mount(&server)
            .await;

        let executor = FallbackExecutor::new(reqwest::Client::new());
        let registry = registry_with(vec![local_entry_at(&server, "qwen3-4b")]);
        let started = std::time::Instant::now();
        let outcome = executor
            .execute(
                &GenerateRequest::new("hi"),
                &ModelRef::parse("local").unwrap(),
                &config(),
                &registry,
                Instant::now() + Duration::from_millis(200),
            )
            .await;

        assert!(!outcome.succeeded());
        assert!(outcome.deadline_exceeded());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn failure_summaries_retain_every_backend_error() {
        let executor = FallbackExecutor::new(reqwest::Client::new());
        let registry = registry_with(vec![
            local_entry("qwen3-4b", false), // unreachable: lookup fails
            cloud_entry(crate::registry::Provider::Anthropic, "claude-sonnet-4-5"),
        ]);
        // No ANTHROPIC_API_KEY in the test environment: backend_for fails
        // with a terminal auth error, which must also be retained.
        std::env::remove_var("ANTHROPIC_API_KEY");
        let outcome = executor
            .execute(
                &GenerateRequest::new("hi"),
                &ModelRef::parse("local").unwrap(),
                &config(),
                &registry,
                far_deadline(),
            )
            .await;

        assert!(!outcome.succeeded());
        let summaries = outcome.failure_summaries();
        assert_eq!(summaries.len(), outcome.attempts.len());
        assert!(summaries.iter().any(|s| s.starts_with("local")));
        assert!(summaries.iter().any(|s| s.starts_with("cloud")));
    }
}
