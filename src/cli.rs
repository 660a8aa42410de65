//! Command-line interface
//!
//! Subcommands for querying the router, managing the registry, and working
//! with the conversation store. Exit codes: 0 success, 1 usage error,
//! 2 configuration error, 3 all backends failed, 4 store error.

use crate::error::RouterError;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Cost-aware request router for LLM backends
#[derive(Parser)]
#[command(name = "thriftroute")]
#[command(version)]
#[command(about = "Routes each request to the cheapest backend that can answer it")]
#[command(
    long_about = "Thriftroute dispatches natural-language requests to local LLM runtimes \
    first and cloud providers as fallback, selecting the cheapest backend that can \
    competently answer each request."
)]
pub struct Cli {
    /// Path to the configuration file (also: ROUTER_CONFIG_PATH)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    /// Resolve the config path: flag, then environment, then convention.
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .or_else(|| std::env::var("ROUTER_CONFIG_PATH").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config.yaml"))
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the HTTP server (the default when no subcommand is given)
    Serve,
    /// Route one query and print the response
    Query {
        text: String,
        /// Skip triage and force this model reference
        #[arg(long)]
        force: Option<String>,
        /// Append to an existing conversation instead of starting one
        #[arg(long)]
        session: Option<i64>,
    },
    /// Probe runtimes and refresh the model registry
    Scan,
    /// Print router statistics
    Stats,
    /// List the detected models
    Models,
    /// Ask a running server to reload its configuration
    Reload,
    /// Conversation history management
    Conversation {
        #[command(subcommand)]
        command: ConversationCommand,
    },
    /// Generate a template configuration file
    Config {
        /// Output file path (prints to stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Template configuration content for `thriftroute config`.
pub fn generate_config_template() -> &'static str {
    r#"# Thriftroute configuration
# ==========================
#
# Routing rules, pricing, the fallback chain, and timeouts. The router
# prefers local runtimes and falls back to cloud providers; credentials
# come from *_API_KEY environment variables, never from this file.

server:
  host: "127.0.0.1"
  port: 8000
  # Per-request deadline; exceeding it cancels the in-flight attempt
  request_timeout_seconds: 120
  max_concurrent_requests: 16

models:
  local:
    # Primary local runtime (LM Studio shown; Ollama uses port 11434)
    endpoint: "http://localhost:1234/v1"
    # Preferred model id when more than one is loaded
    model: "qwen3-4b"
  cloud:
    # Default cloud provider: anthropic, openai, google, openrouter, moonshot
    provider: "anthropic"
    model: "claude-sonnet-4-5"

routing:
  # Deterministic rules, evaluated in order. The first rule whose trigger
  # substring appears in the input wins. Matching is case-sensitive.
  hard_rules:
    - triggers: ["見積", "estimate"]
      model: "cloud:claude-sonnet-4-5"
      reason: "cost estimates need the stronger model"
  intelligent_routing:
    # Delegate ambiguous requests to a small local classifier
    enabled: true
    # Local recommendations below this confidence upgrade to cloud
    confidence_threshold: 0.75
    triage_prompt: |
      You are a request triage assistant. Classify the following request and
      answer with a JSON object {"model": "local" or "cloud",
      "confidence": 0.0-1.0, "reason": "..."}.

      Request:
      {input}
    classifier_model: "qwen3-4b"
    timeout_seconds: 10

fallback:
  # Tried in order after the triaged preference. `local` resolves to the
  # first reachable local model, `cloud` to the default cloud model.
  chain: ["local", "cloud"]

cost:
  # Prices per million tokens, used for cost and savings accounting
  pricing:
    claude-sonnet-4-5:
      input: 3.0
      output: 15.0
  # Display currency multiplier (e.g. 150.0 for JPY)
  fx_rate: 1.0

scanner:
  # Registry refresh interval in seconds
  cache_ttl: 300
  probe_timeout_seconds: 3
  # Extra hostnames admitted past the loopback-only scan guard
  allowed_hosts: []

database:
  path: "data/conversations.db"

retry:
  max_attempts: 3
  base_delay_ms: 1000
  max_delay_ms: 30000
  exponential_base: 2.0
"#
}

#[derive(Subcommand)]
pub enum ConversationCommand {
    /// List conversations
    List {
        #[arg(long)]
        topic: Option<i64>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
        /// Sort field: created_at, updated_at, title, message_count
        #[arg(long, default_value = "updated_at")]
        sort: String,
        #[arg(long)]
        ascending: bool,
    },
    /// Show one conversation with its messages
    Show { id: i64 },
    /// Full-text search across titles and message content
    Search {
        query: String,
        #[arg(long)]
        status: Option<String>,
    },
    /// Export conversations to a JSON document
    Export {
        /// Conversation ids (everything when omitted)
        ids: Vec<i64>,
        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Import conversations from a JSON document
    Import { file: PathBuf },
    /// Store statistics
    Stats,
}

/// Map an error onto the documented exit codes.
pub fn exit_code(error: &RouterError) -> i32 {
    match error {
        RouterError::Validation(_) | RouterError::NotFound(_) => 1,
        RouterError::Config(_) => 2,
        RouterError::Store(_) => 4,
        RouterError::AllBackendsFailed { .. }
        | RouterError::NoBackends(_)
        | RouterError::Backend { .. }
        | RouterError::DeadlineExceeded(_)
        | RouterError::ContextTooLarge { .. }
        | RouterError::Busy => 3,
    }
}
