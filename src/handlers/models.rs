//! Registry endpoints: scan trigger and detected-models listing

use super::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

/// POST /models/scan
///
/// Returns 202 immediately; the refresh proceeds in the background.
pub async fn scan(State(state): State<AppState>) -> impl IntoResponse {
    let facade = state.facade().clone();
    tokio::spawn(async move {
        let change = facade.refresh_registry().await;
        tracing::info!(
            added = change.added.len(),
            removed = change.removed.len(),
            updated = change.updated.len(),
            "Scan requested over HTTP finished"
        );
    });
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"success": true, "status": "scan started"})),
    )
}

/// GET /models/detected
pub async fn detected(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.facade().registry().snapshot_unchecked();
    Json(serde_json::json!({
        "models": snapshot.list_all(),
        "last_scan": snapshot.last_scan_at,
        "cache_valid": !snapshot.is_stale(),
    }))
}
