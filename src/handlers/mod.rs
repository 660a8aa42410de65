//! HTTP control surface
//!
//! Axum handlers over the router facade. State is a cheap-to-clone wrapper
//! around `Arc`s; handlers run concurrently on separate tasks.

pub mod conversations;
pub mod health;
pub mod models;
pub mod router;

use crate::facade::RouterFacade;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tower_http::cors::{AllowOrigin, CorsLayer};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    facade: Arc<RouterFacade>,
    rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(facade: Arc<RouterFacade>) -> Self {
        Self {
            facade,
            rate_limiter: Arc::new(RateLimiter::from_env()),
        }
    }

    pub fn facade(&self) -> &Arc<RouterFacade> {
        &self.facade
    }
}

/// Minimum inter-request spacing per source, driven by
/// `ROUTER_RATE_LIMIT_MS`. Disabled when the variable is unset.
struct RateLimiter {
    min_interval: Option<Duration>,
    last_seen: Mutex<HashMap<IpAddr, Instant>>,
}

impl RateLimiter {
    fn from_env() -> Self {
        let min_interval = std::env::var("ROUTER_RATE_LIMIT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);
        if let Some(interval) = min_interval {
            tracing::info!(interval_ms = interval.as_millis() as u64, "Rate limiting enabled");
        }
        Self {
            min_interval,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Returns false when the source must slow down.
    fn admit(&self, source: IpAddr) -> bool {
        let Some(min_interval) = self.min_interval else {
            return true;
        };
        let mut last_seen = self.last_seen.lock().expect("rate limiter lock poisoned");
        let now = Instant::now();
        match last_seen.get(&source) {
            Some(previous) if now.duration_since(*previous) < min_interval => false,
            _ => {
                last_seen.insert(source, now);
                true
            }
        }
    }
}

async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    // ConnectInfo is absent when the router is driven directly (tests);
    // those callers share one bucket.
    let source = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    if !state.rate_limiter.admit(source) {
        let body = Json(serde_json::json!({
            "error": "request rate exceeded, slow down",
        }));
        return (StatusCode::TOO_MANY_REQUESTS, body).into_response();
    }
    next.run(request).await
}

/// CORS allow-list from `ROUTER_ALLOWED_ORIGINS` (comma-separated).
/// Without the variable, cross-origin requests are not admitted.
fn cors_layer() -> CorsLayer {
    let origins: Vec<HeaderValue> = std::env::var("ROUTER_ALLOWED_ORIGINS")
        .unwrap_or_default()
        .split(',')
        .filter_map(|origin| {
            let trimmed = origin.trim();
            if trimmed.is_empty() {
                return None;
            }
            match trimmed.parse::<HeaderValue>() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(origin = %trimmed, "Ignoring unparseable CORS origin");
                    None
                }
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

/// Assemble the full HTTP router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::handler))
        .route("/router/query", post(router::query))
        .route("/router/stats", get(router::stats))
        .route("/router/config/reload", post(router::reload))
        .route("/models/scan", post(models::scan))
        .route("/models/detected", get(models::detected))
        .route(
            "/api/v1/conversations",
            get(conversations::list).post(conversations::create),
        )
        .route("/api/v1/conversations/stats", get(conversations::stats))
        .route(
            "/api/v1/conversations/{id}",
            get(conversations::show)
                .put(conversations::update)
                .delete(conversations::delete),
        )
        .route(
            "/api/v1/conversations/{id}/messages",
            post(conversations::append_message),
        )
        .route("/api/v1/search", get(conversations::search))
        .route("/api/v1/export", post(conversations::export))
        .route("/api/v1/import", post(conversations::import))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            rate_limit,
        ))
        .layer(cors_layer())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
