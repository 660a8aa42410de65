//! Routing endpoints: query, stats, config reload

use super::AppState;
use crate::backends::ImagePayload;
use crate::error::RouterError;
use crate::facade::QueryRequest;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct QueryBody {
    pub input: String,
    #[serde(default)]
    pub force_model: Option<String>,
    #[serde(default)]
    pub session_id: Option<i64>,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
    #[serde(default)]
    pub image: Option<ImagePayload>,
}

/// POST /router/query
pub async fn query(
    State(state): State<AppState>,
    Json(body): Json<QueryBody>,
) -> Result<impl IntoResponse, RouterError> {
    let reply = state
        .facade()
        .handle_query(QueryRequest {
            input: body.input,
            image: body.image,
            session_id: body.session_id,
            force_model: body.force_model,
            context: body.context,
        })
        .await?;

    let completion = reply.outcome.response.as_ref();
    Ok(Json(serde_json::json!({
        "success": true,
        "model": reply.outcome.model_ref,
        "response": completion.map(|c| c.text.clone()),
        "metadata": {
            "origin": reply.decision.origin,
            "confidence": reply.decision.confidence,
            "reason": reply.decision.reason,
            "conversation_id": reply.conversation_id,
            "attempts": reply.outcome.attempts,
            "cost_warning": reply.outcome.cost_warning,
            "store_warning": reply.outcome.store_warning,
            "tokens_in": completion.map(|c| c.tokens_in),
            "tokens_out": completion.map(|c| c.tokens_out),
            "cost": completion.map(|c| c.cost),
            "saved_cost": completion.map(|c| c.saved_cost),
        },
    })))
}

/// GET /router/stats
pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.facade().stats())
}

/// POST /router/config/reload
pub async fn reload(State(state): State<AppState>) -> Result<impl IntoResponse, RouterError> {
    state.facade().reload_config().await?;
    Ok(Json(serde_json::json!({"success": true})))
}
