//! Conversation CRUD, search, and export/import endpoints

use super::AppState;
use crate::error::RouterError;
use crate::store::export::{export_to_json, import_from_json, ExportDocument};
use crate::store::{ConversationFilters, ConversationStatus, Role, SortField};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub topic_id: Option<i64>,
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub sort: Option<String>,
    pub ascending: Option<bool>,
}

impl ListParams {
    fn to_filters(&self) -> Result<ConversationFilters, RouterError> {
        let status = self
            .status
            .as_deref()
            .map(str::parse::<ConversationStatus>)
            .transpose()?;
        let sort = self
            .sort
            .as_deref()
            .map(str::parse::<SortField>)
            .transpose()?
            .unwrap_or_default();
        Ok(ConversationFilters {
            topic_id: self.topic_id,
            status,
            limit: self.limit,
            offset: self.offset,
            sort,
            ascending: self.ascending.unwrap_or(false),
            ..Default::default()
        })
    }
}

/// GET /api/v1/conversations
pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, RouterError> {
    let filters = params.to_filters()?;
    let conversations = state.facade().store().list_conversations(&filters).await?;
    Ok(Json(serde_json::json!({"conversations": conversations})))
}

#[derive(Debug, Deserialize)]
pub struct CreateBody {
    pub title: String,
    #[serde(default)]
    pub topic: Option<String>,
}

/// POST /api/v1/conversations
pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateBody>,
) -> Result<impl IntoResponse, RouterError> {
    let store = state.facade().store();
    let topic_id = match &body.topic {
        Some(name) => Some(store.get_or_create_topic(name).await?),
        None => None,
    };
    let id = store.create_conversation(&body.title, topic_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({"id": id})),
    ))
}

/// GET /api/v1/conversations/{id}
pub async fn show(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, RouterError> {
    let store = state.facade().store();
    let conversation = store
        .get_conversation(id)
        .await?
        .ok_or_else(|| RouterError::NotFound(format!("conversation {id} does not exist")))?;
    let messages = store.get_messages(id, None, None).await?;
    Ok(Json(serde_json::json!({
        "conversation": conversation,
        "messages": messages,
    })))
}

#[derive(Debug, Deserialize)]
pub struct UpdateBody {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// PUT /api/v1/conversations/{id}
pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateBody>,
) -> Result<impl IntoResponse, RouterError> {
    let store = state.facade().store();
    let mut changed = false;
    if let Some(title) = &body.title {
        changed |= store.rename_conversation(id, title).await?;
    }
    if let Some(status) = &body.status {
        changed |= store.set_status(id, status.parse()?).await?;
    }
    if !changed {
        return Err(RouterError::NotFound(format!(
            "conversation {id} does not exist or nothing to update"
        )));
    }
    Ok(Json(serde_json::json!({"success": true})))
}

/// DELETE /api/v1/conversations/{id}
pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, RouterError> {
    let deleted = state.facade().store().delete_conversation(id).await?;
    if !deleted {
        return Err(RouterError::NotFound(format!(
            "conversation {id} does not exist"
        )));
    }
    Ok(Json(serde_json::json!({"success": true})))
}

#[derive(Debug, Deserialize)]
pub struct AppendBody {
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub model_ref: Option<String>,
}

/// POST /api/v1/conversations/{id}/messages
pub async fn append_message(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<AppendBody>,
) -> Result<impl IntoResponse, RouterError> {
    let role: Role = body.role.parse()?;
    let message_id = state
        .facade()
        .store()
        .append_message(id, role, &body.content, body.model_ref.as_deref())
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({"id": message_id})),
    ))
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: String,
    pub topic_id: Option<i64>,
    pub status: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
}

/// GET /api/v1/search
pub async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, RouterError> {
    if params.q.trim().is_empty() {
        return Err(RouterError::Validation(
            "search query cannot be empty".to_string(),
        ));
    }
    let filters = ConversationFilters {
        topic_id: params.topic_id,
        status: params
            .status
            .as_deref()
            .map(str::parse::<ConversationStatus>)
            .transpose()?,
        date_from: params.date_from,
        date_to: params.date_to,
        ..Default::default()
    };
    let hits = state
        .facade()
        .store()
        .search_conversations(&params.q, &filters)
        .await?;
    Ok(Json(serde_json::json!({"hits": hits})))
}

#[derive(Debug, Default, Deserialize)]
pub struct ExportBody {
    #[serde(default)]
    pub conversation_ids: Option<Vec<i64>>,
    #[serde(default)]
    pub topic_id: Option<i64>,
}

/// POST /api/v1/export
pub async fn export(
    State(state): State<AppState>,
    Json(body): Json<ExportBody>,
) -> Result<impl IntoResponse, RouterError> {
    let document = export_to_json(
        state.facade().store(),
        body.conversation_ids.as_deref(),
        body.topic_id,
    )
    .await?;
    Ok(Json(document))
}

/// POST /api/v1/import
pub async fn import(
    State(state): State<AppState>,
    Json(document): Json<ExportDocument>,
) -> Result<impl IntoResponse, RouterError> {
    let created = import_from_json(state.facade().store(), &document).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({"created": created})),
    ))
}

/// GET /api/v1/conversations/stats
pub async fn stats(State(state): State<AppState>) -> Result<impl IntoResponse, RouterError> {
    let stats = state.facade().store().stats().await?;
    Ok(Json(stats))
}
