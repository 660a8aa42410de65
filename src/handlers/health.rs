//! Liveness endpoint

use axum::Json;

/// GET /health
pub async fn handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}
