//! Conversation JSON export / import
//!
//! Document shape: a version tag, an ISO-8601 export date, the full
//! conversation payload, and derived metadata. Importers accept any minor
//! version under the same major, and unknown fields survive a round-trip
//! via captured extras.

use super::{ConversationFilters, ConversationStore, Role};
use crate::error::{AppResult, RouterError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const EXPORT_VERSION: &str = "1.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportDocument {
    pub version: String,
    pub export_date: String,
    pub conversations: Vec<ExportConversation>,
    pub metadata: ExportMetadata,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConversation {
    pub id: i64,
    pub title: String,
    pub topic: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub messages: Vec<ExportMessage>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportMessage {
    pub role: String,
    pub content: String,
    pub model: Option<String>,
    pub timestamp: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportMetadata {
    pub message_count: usize,
    pub user_messages: usize,
    pub assistant_messages: usize,
    pub models_used: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Export selected conversations (all of them when no filter is given).
pub async fn export_to_json(
    store: &ConversationStore,
    conversation_ids: Option<&[i64]>,
    topic_id: Option<i64>,
) -> AppResult<ExportDocument> {
    let ids: Vec<i64> = match conversation_ids {
        Some(ids) => ids.to_vec(),
        None => {
            let filters = ConversationFilters {
                topic_id,
                limit: Some(i64::MAX),
                ..Default::default()
            };
            store
                .list_conversations(&filters)
                .await?
                .into_iter()
                .map(|c| c.id)
                .collect()
        }
    };

    let mut conversations = Vec::with_capacity(ids.len());
    let mut metadata = ExportMetadata::default();
    let mut models: BTreeSet<String> = BTreeSet::new();

    for id in ids {
        let Some(conversation) = store.get_conversation(id).await? else {
            return Err(RouterError::NotFound(format!(
                "conversation {id} does not exist"
            )));
        };
        let messages = store.get_messages(id, None, None).await?;

        let mut exported_messages = Vec::with_capacity(messages.len());
        for message in messages {
            metadata.message_count += 1;
            match message.role {
                Role::User => metadata.user_messages += 1,
                Role::Assistant => metadata.assistant_messages += 1,
                Role::System => {}
            }
            if let Some(model) = &message.model_ref {
                models.insert(model.clone());
            }
            exported_messages.push(ExportMessage {
                role: message.role.as_str().to_string(),
                content: message.content,
                model: message.model_ref,
                timestamp: message.timestamp,
                extra: serde_json::Map::new(),
            });
        }

        conversations.push(ExportConversation {
            id: conversation.id,
            title: conversation.title,
            topic: conversation.topic_name,
            created_at: conversation.created_at,
            updated_at: conversation.updated_at,
            messages: exported_messages,
            extra: serde_json::Map::new(),
        });
    }

    metadata.models_used = models.into_iter().collect();

    Ok(ExportDocument {
        version: EXPORT_VERSION.to_string(),
        export_date: Utc::now().to_rfc3339(),
        conversations,
        metadata,
        extra: serde_json::Map::new(),
    })
}

/// Import a document, returning the newly assigned conversation ids.
///
/// Topics are matched by name and reused when present, re-created
/// otherwise. Assigned ids always differ from the ones in the document.
pub async fn import_from_json(
    store: &ConversationStore,
    document: &ExportDocument,
) -> AppResult<Vec<i64>> {
    check_version(&document.version)?;

    let mut created = Vec::with_capacity(document.conversations.len());
    for conversation in &document.conversations {
        let topic_id = match &conversation.topic {
            Some(name) => Some(store.get_or_create_topic(name).await?),
            None => None,
        };

        let id = store
            .create_conversation(&conversation.title, topic_id)
            .await?;

        for message in &conversation.messages {
            let role: Role = message.role.parse()?;
            if role == Role::Assistant && message.model.is_none() {
                return Err(RouterError::Validation(format!(
                    "conversation '{}': assistant message without a model",
                    conversation.title
                )));
            }
            store
                .append_message_at(
                    id,
                    role,
                    &message.content,
                    message.model.as_deref(),
                    &message.timestamp,
                )
                .await?;
        }
        created.push(id);
    }
    Ok(created)
}

/// Accept any minor version with the same major.
fn check_version(version: &str) -> AppResult<()> {
    let major = version.split('.').next().unwrap_or("");
    let expected_major = EXPORT_VERSION.split('.').next().unwrap_or("");
    if major == expected_major {
        Ok(())
    } else {
        Err(RouterError::Validation(format!(
            "unsupported export version '{version}' (supported: {expected_major}.x)"
        )))
    }
}
