//! Error types for Thriftroute
//!
//! One error enum for the whole router, with a typed failure-kind
//! classification that drives retry policy. All errors implement
//! `IntoResponse` for Axum handlers.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Failure kind distinguished by the core.
///
/// The kind, not the message, decides retry policy: see [`ErrorKind::is_retryable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    ConnectionRefused,
    DnsFailure,
    TcpTimeout,
    Http5xx,
    RateLimited,
    Http4xx,
    Auth,
    MalformedResponse,
    ModelNotLoaded,
    ContextTooLarge,
    DeadlineExceeded,
    ConfigInvalid,
    StoreIo,
}

impl ErrorKind {
    /// Whether the retry loop may try the same backend again.
    ///
    /// `MalformedResponse` is retryable once; the executor tracks the
    /// first-vs-subsequent distinction itself.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::ConnectionRefused
                | ErrorKind::DnsFailure
                | ErrorKind::TcpTimeout
                | ErrorKind::Http5xx
                | ErrorKind::RateLimited
                | ErrorKind::MalformedResponse
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConnectionRefused => "connection-refused",
            ErrorKind::DnsFailure => "dns-failure",
            ErrorKind::TcpTimeout => "tcp-timeout",
            ErrorKind::Http5xx => "http-5xx",
            ErrorKind::RateLimited => "http-429",
            ErrorKind::Http4xx => "http-4xx",
            ErrorKind::Auth => "auth",
            ErrorKind::MalformedResponse => "malformed-response",
            ErrorKind::ModelNotLoaded => "model-not-loaded",
            ErrorKind::ContextTooLarge => "context-too-large",
            ErrorKind::DeadlineExceeded => "deadline-exceeded",
            ErrorKind::ConfigInvalid => "config-invalid",
            ErrorKind::StoreIo => "store-io",
        }
    }
}

/// Main error type for the application
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    /// One backend call failed. Carries the classification the retry loop
    /// needs, plus the server-advertised retry delay for rate limits.
    #[error("Backend {endpoint} failed ({kind:?}): {message}")]
    Backend {
        endpoint: String,
        kind: ErrorKind,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("No backends available: {0}")]
    NoBackends(String),

    /// Every chain step terminally failed. Each entry is one attempt,
    /// formatted as `ref (kind): message` - nothing is swallowed.
    #[error("All backends failed after {} attempts", failures.len())]
    AllBackendsFailed { failures: Vec<String> },

    #[error("Request deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    #[error("Input of ~{estimated_tokens} tokens exceeds every available model context (largest: {largest_context})")]
    ContextTooLarge {
        estimated_tokens: u64,
        largest_context: u32,
    },

    #[error("Router is at capacity, retry later")]
    Busy,

    #[error("Store error: {0}")]
    Store(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl RouterError {
    /// The failure kind for classification, where one applies.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            RouterError::Backend { kind, .. } => Some(*kind),
            RouterError::Config(_) => Some(ErrorKind::ConfigInvalid),
            RouterError::Store(_) => Some(ErrorKind::StoreIo),
            RouterError::DeadlineExceeded(_) => Some(ErrorKind::DeadlineExceeded),
            RouterError::ContextTooLarge { .. } => Some(ErrorKind::ContextTooLarge),
            _ => None,
        }
    }

    /// Whether the retry loop may attempt the same backend again.
    pub fn is_retryable(&self) -> bool {
        self.kind().map(|k| k.is_retryable()).unwrap_or(false)
    }

    /// Server-advertised delay for rate-limited responses.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RouterError::Backend { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl IntoResponse for RouterError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            Self::Busy => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            Self::NoBackends(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            Self::AllBackendsFailed { failures } => (
                StatusCode::BAD_GATEWAY,
                format!("All backends failed: [{}]", failures.join("; ")),
            ),
            Self::Backend { .. } => (StatusCode::BAD_GATEWAY, self.to_string()),
            Self::DeadlineExceeded(_) => (StatusCode::GATEWAY_TIMEOUT, self.to_string()),
            Self::ContextTooLarge { .. } => (StatusCode::BAD_REQUEST, self.to_string()),
            Self::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            Self::Store(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(serde_json::json!({
            "error": redact_secrets(&message),
            "kind": self.kind().map(|k| k.as_str()),
        }));

        (status, body).into_response()
    }
}

/// Convenience type alias for Results
pub type AppResult<T> = Result<T, RouterError>;

/// Mask credential material before a message reaches logs or responses.
///
/// Covers the token shapes that appear in provider traffic: `sk-...` API
/// keys, `Bearer <token>` headers, and `key=...` query parameters. The
/// surrounding text is preserved so diagnostics stay useful.
pub fn redact_secrets(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while !rest.is_empty() {
        if let Some(pos) = find_secret_start(rest) {
            let (before, tail) = rest.split_at(pos);
            out.push_str(before);
            let consumed = secret_token_len(tail);
            out.push_str("[REDACTED]");
            rest = &tail[consumed..];
        } else {
            out.push_str(rest);
            break;
        }
    }

    out
}

fn find_secret_start(text: &str) -> Option<usize> {
    let candidates = [
        text.find("sk-"),
        text.find("Bearer "),
        text.find("key="),
        text.find("api_key="),
    ];
    candidates.into_iter().flatten().min()
}

fn secret_token_len(tail: &str) -> usize {
    // Consume the marker plus the token that follows it, up to the first
    // character that cannot be part of a credential.
    let marker_len = if tail.starts_with("Bearer ") {
        7
    } else if tail.starts_with("api_key=") {
        8
    } else if tail.starts_with("key=") {
        4
    } else {
        3 // "sk-"
    };

    let token_len = tail[marker_len..]
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'))
        .unwrap_or(tail.len() - marker_len);

    marker_len + token_len
}

/// Map a reqwest transport error into the taxonomy.
pub fn classify_transport(endpoint: &str, err: &reqwest::Error) -> RouterError {
    let kind = if err.is_timeout() {
        ErrorKind::TcpTimeout
    } else if err.is_connect() {
        // reqwest folds DNS resolution into connect errors; inspect the chain
        // to keep the dns-failure kind distinct.
        let text = format!("{err:?}");
        if text.contains("dns") || text.contains("resolve") {
            ErrorKind::DnsFailure
        } else {
            ErrorKind::ConnectionRefused
        }
    } else {
        ErrorKind::ConnectionRefused
    };

    RouterError::Backend {
        endpoint: endpoint.to_string(),
        kind,
        message: redact_secrets(&err.to_string()),
        retry_after: None,
    }
}

/// Map a non-2xx HTTP status into the taxonomy.
///
/// `retry_after` is the parsed `Retry-After` header value, honored for 429.
pub fn classify_status(
    endpoint: &str,
    status: u16,
    body: &str,
    retry_after: Option<Duration>,
) -> RouterError {
    let kind = match status {
        401 | 403 => ErrorKind::Auth,
        429 => ErrorKind::RateLimited,
        404 if body.contains("model") => ErrorKind::ModelNotLoaded,
        413 => ErrorKind::ContextTooLarge,
        s if s >= 500 => ErrorKind::Http5xx,
        _ if body.contains("context length") || body.contains("context_length") => {
            ErrorKind::ContextTooLarge
        }
        _ => ErrorKind::Http4xx,
    };

    let preview: String = body.chars().take(300).collect();
    RouterError::Backend {
        endpoint: endpoint.to_string(),
        kind,
        message: redact_secrets(&format!("HTTP {status}: {preview}")),
        retry_after: if kind == ErrorKind::RateLimited {
            retry_after
        } else {
            None
        },
    }
}
