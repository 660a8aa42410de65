//! Router facade: the single public entry point
//!
//! Owns the registry, store, triage engine, executor, and statistics, and
//! passes them down explicitly - multiple routers in one process (as the
//! tests do) need no shared globals. The store notifies interested parties
//! only through its observer channels; there is no back-pointer.

use crate::backends::{GenerateRequest, HistoryMessage, ImagePayload};
use crate::config::Config;
use crate::error::{AppResult, RouterError};
use crate::executor::{FallbackExecutor, RequestOutcome};
use crate::registry::{ModelRef, Registry};
use crate::stats::{RouterStats, StatsSnapshot};
use crate::store::{ConversationStore, Role};
use crate::triage::{estimate_tokens, TriageDecision, TriageEngine, TriageInput};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;

/// How many prior messages feed back into the prompt as context.
const HISTORY_WINDOW: usize = 20;

/// Content of the stub appended when a request is cancelled mid-flight.
pub const INTERRUPTED_STUB: &str = "(interrupted)";

/// Content of the stub appended when every chain step failed.
pub const ALL_FAILED_STUB: &str = "(all backends failed)";

/// A request into the router.
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub input: String,
    pub image: Option<ImagePayload>,
    pub session_id: Option<i64>,
    pub force_model: Option<String>,
    pub context: Option<serde_json::Value>,
}

/// Everything a caller learns about one routed request.
#[derive(Debug)]
pub struct QueryReply {
    pub outcome: RequestOutcome,
    pub decision: TriageDecision,
    pub conversation_id: Option<i64>,
}

pub struct RouterFacade {
    config: RwLock<Arc<Config>>,
    config_path: Option<PathBuf>,
    registry: Arc<Registry>,
    store: Arc<ConversationStore>,
    triage: TriageEngine,
    executor: FallbackExecutor,
    stats: Arc<RouterStats>,
    limiter: Arc<Semaphore>,
    client: reqwest::Client,
}

impl RouterFacade {
    /// Build a facade from a validated configuration. `config_path` enables
    /// `reload_config`; pass `None` for ephemeral (test) routers.
    pub async fn new(config: Config, config_path: Option<PathBuf>) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| RouterError::Config(format!("cannot build HTTP client: {e}")))?;

        let registry = Arc::new(Registry::new(
            config.scanner.cache_ttl,
            config.registry_snapshot_path(),
        ));
        let store = Arc::new(ConversationStore::open(&config.database.path).await?);
        let limiter = Arc::new(Semaphore::new(config.server.max_concurrent_requests));

        Ok(Self {
            config: RwLock::new(Arc::new(config)),
            config_path,
            registry,
            store,
            triage: TriageEngine::new(client.clone()),
            executor: FallbackExecutor::new(client.clone()),
            stats: Arc::new(RouterStats::new()),
            limiter,
            client,
        })
    }

    /// In-memory variant: no snapshot file, no database file. Useful for
    /// embedding a throwaway router, and what the test suite builds on.
    pub async fn new_in_memory(config: Config) -> AppResult<Self> {
        let client = reqwest::Client::new();
        let registry = Arc::new(Registry::new(
            config.scanner.cache_ttl,
            std::env::temp_dir().join(format!(
                "thriftroute-registry-{}.json",
                std::process::id()
            )),
        ));
        let store = Arc::new(ConversationStore::open_in_memory().await?);
        let limiter = Arc::new(Semaphore::new(config.server.max_concurrent_requests));
        Ok(Self {
            config: RwLock::new(Arc::new(config)),
            config_path: None,
            registry,
            store,
            triage: TriageEngine::new(client.clone()),
            executor: FallbackExecutor::new(client.clone()),
            stats: Arc::new(RouterStats::new()),
            limiter,
            client,
        })
    }

    /// Current configuration snapshot. In-flight requests keep the snapshot
    /// they started with.
    pub fn config(&self) -> Arc<Config> {
        self.config.read().expect("config lock poisoned").clone()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Trigger one registry refresh now.
    pub async fn refresh_registry(&self) -> crate::registry::RegistryChange {
        let config = self.config();
        self.registry.refresh(&config, &self.client).await
    }

    /// Spawn the background loop that refreshes the registry every TTL
    /// interval, after one immediate refresh.
    pub fn start_background_refresh(self: &Arc<Self>) {
        let facade = self.clone();
        tokio::spawn(async move {
            facade.refresh_registry().await;
            loop {
                let interval = facade.config().scanner.cache_ttl;
                tokio::time::sleep(Duration::from_secs(interval)).await;
                facade.refresh_registry().await;
            }
        });
    }

    /// Re-parse the configuration file and swap it in atomically. In-flight
    /// requests continue with the prior snapshot; the next request sees the
    /// new one.
    pub async fn reload_config(&self) -> AppResult<()> {
        let Some(path) = &self.config_path else {
            return Err(RouterError::Config(
                "this router was built without a config file".to_string(),
            ));
        };
        let fresh = Config::from_file(path)?;
        let mut guard = self.config.write().expect("config lock poisoned");
        *guard = Arc::new(fresh);
        tracing::info!(path = %path.display(), "Configuration reloaded");
        Ok(())
    }

    /// Route one request: triage, execute through the fallback chain, and
    /// persist the exchange.
    pub async fn handle_query(&self, request: QueryRequest) -> AppResult<QueryReply> {
        // Backpressure first: over-limit callers get an immediate busy
        // error, the router does not queue.
        let _permit = self.limiter.try_acquire().map_err(|_| RouterError::Busy)?;

        if request.input.trim().is_empty() {
            return Err(RouterError::Validation(
                "input cannot be empty".to_string(),
            ));
        }

        let config = self.config();
        let registry = self.registry.snapshot();

        self.stats.record_request();
        if request.image.is_some() {
            self.stats.record_vision();
        }

        if registry.is_empty() {
            return Err(RouterError::NoBackends(
                "no local runtime is reachable and no cloud credentials are configured"
                    .to_string(),
            ));
        }

        // Nothing can take the input: fail before any backend call.
        let estimate = estimate_tokens(&request.input);
        let largest = registry.largest_context();
        if estimate > u64::from(largest) {
            return Err(RouterError::ContextTooLarge {
                estimated_tokens: estimate,
                largest_context: largest,
            });
        }

        let forced = match &request.force_model {
            Some(raw) => Some(ModelRef::parse(raw)?),
            None => None,
        };

        let triage_input = TriageInput {
            text: &request.input,
            has_image: request.image.is_some(),
            forced,
        };
        let decision = self.triage.triage(&triage_input, &config, &registry).await?;
        tracing::info!(
            preferred = %decision.preferred,
            origin = ?decision.origin,
            confidence = decision.confidence,
            "Triage decision"
        );

        // Persist the user message before the backend call so an
        // interrupted request still leaves a searchable question. Store
        // failures degrade to a warning; they never block routing.
        let mut store_warning = None;
        let conversation_id = match self
            .ensure_conversation(&request)
            .await
        {
            Ok(id) => Some(id),
            Err(e @ RouterError::NotFound(_)) => return Err(e),
            Err(e) => {
                tracing::error!(error = %e, "Could not persist user message");
                store_warning = Some(e.to_string());
                None
            }
        };

        let history = match conversation_id {
            Some(id) => self.recent_history(id).await,
            None => Vec::new(),
        };

        let mut generate = GenerateRequest::new(request.input.clone());
        generate.image = request.image.clone();
        generate.history = history;
        if let Some(context) = &request.context {
            generate.system = Some(format!("Additional caller context: {context}"));
        }

        let deadline =
            Instant::now() + Duration::from_secs(config.server.request_timeout_seconds);
        let mut outcome = self
            .executor
            .execute(&generate, &decision.preferred, &config, &registry, deadline)
            .await;
        outcome.store_warning = store_warning;

        if let Some(completion) = &outcome.response {
            if outcome.fell_back() {
                self.stats.record_fallback();
            }
            let used_local = completion.model_key.starts_with("local:");
            self.stats
                .record_completion(used_local, completion.cost, completion.saved_cost);

            if let Some(id) = conversation_id {
                if let Err(e) = self
                    .store
                    .append_message(id, Role::Assistant, &completion.text, Some(&completion.model_key))
                    .await
                {
                    tracing::error!(error = %e, "Could not persist assistant message");
                    outcome.store_warning = Some(e.to_string());
                }
            }

            return Ok(QueryReply {
                outcome,
                decision,
                conversation_id,
            });
        }

        // Failure paths: leave a stub so the conversation records what
        // happened to the question.
        let stub = if outcome.deadline_exceeded() {
            INTERRUPTED_STUB
        } else {
            ALL_FAILED_STUB
        };
        if let Some(id) = conversation_id {
            if let Err(e) = self.store.append_message(id, Role::System, stub, None).await {
                tracing::error!(error = %e, "Could not persist failure stub");
            }
        }

        if outcome.deadline_exceeded() {
            return Err(RouterError::DeadlineExceeded(Duration::from_secs(
                config.server.request_timeout_seconds,
            )));
        }
        Err(RouterError::AllBackendsFailed {
            failures: outcome.failure_summaries(),
        })
    }

    async fn ensure_conversation(&self, request: &QueryRequest) -> AppResult<i64> {
        let conversation_id = match request.session_id {
            Some(id) => {
                if self.store.get_conversation(id).await?.is_none() {
                    return Err(RouterError::NotFound(format!(
                        "conversation {id} does not exist"
                    )));
                }
                id
            }
            None => {
                let title: String = request.input.chars().take(48).collect();
                self.store.create_conversation(&title, None).await?
            }
        };
        self.store
            .append_message(conversation_id, Role::User, &request.input, None)
            .await?;
        Ok(conversation_id)
    }

    /// The trailing window of the conversation, oldest first, excluding the
    /// just-persisted user message.
    async fn recent_history(&self, conversation_id: i64) -> Vec<HistoryMessage> {
        let messages = match self.store.get_messages(conversation_id, None, None).await {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "Could not load history, continuing without");
                return Vec::new();
            }
        };
        let mut history: Vec<HistoryMessage> = messages
            .iter()
            .map(|m| HistoryMessage {
                role: m.role.as_str().to_string(),
                content: m.content.clone(),
            })
            .collect();
        // Drop the user message we just appended; it is the prompt itself.
        history.pop();
        let overflow = history.len().saturating_sub(HISTORY_WINDOW);
        history.drain(..overflow);
        history
    }
}
