//! Conversation store
//!
//! Durable, indexed conversation log over a single SQLite file. Writers are
//! serialized by the store; readers run in parallel. Observers receive
//! events over channels after each write commits, and a slow or dead
//! observer can never fail a write.

pub mod export;

use crate::error::{AppResult, RouterError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Message role vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl FromStr for Role {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(RouterError::Validation(format!("unknown role '{other}'"))),
        }
    }
}

/// Conversation lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Paused,
    Closed,
    Archived,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Paused => "paused",
            ConversationStatus::Closed => "closed",
            ConversationStatus::Archived => "archived",
        }
    }
}

impl FromStr for ConversationStatus {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ConversationStatus::Active),
            "paused" => Ok(ConversationStatus::Paused),
            "closed" => Ok(ConversationStatus::Closed),
            "archived" => Ok(ConversationStatus::Archived),
            other => Err(RouterError::Validation(format!("unknown status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: i64,
    pub title: String,
    pub topic_id: Option<i64>,
    pub topic_name: Option<String>,
    pub status: ConversationStatus,
    pub created_at: String,
    pub updated_at: String,
    pub message_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageRecord {
    pub id: i64,
    pub conversation_id: i64,
    pub role: Role,
    pub content: String,
    pub model_ref: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Topic {
    pub id: i64,
    pub name: String,
    pub parent_id: Option<i64>,
    pub created_at: String,
}

/// A search result with its match count for ranking.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub match_count: i64,
}

/// Sort key for conversation listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    CreatedAt,
    #[default]
    UpdatedAt,
    Title,
    MessageCount,
}

impl SortField {
    fn as_sql(&self) -> &'static str {
        match self {
            SortField::CreatedAt => "c.created_at",
            SortField::UpdatedAt => "c.updated_at",
            SortField::Title => "c.title",
            SortField::MessageCount => "message_count",
        }
    }
}

impl FromStr for SortField {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created_at" => Ok(SortField::CreatedAt),
            "updated_at" => Ok(SortField::UpdatedAt),
            "title" => Ok(SortField::Title),
            "message_count" => Ok(SortField::MessageCount),
            other => Err(RouterError::Validation(format!(
                "unknown sort field '{other}' (expected created_at, updated_at, title, or message_count)"
            ))),
        }
    }
}

/// Filters for search and listing.
#[derive(Debug, Clone, Default)]
pub struct ConversationFilters {
    pub topic_id: Option<i64>,
    pub status: Option<ConversationStatus>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub sort: SortField,
    pub ascending: bool,
}

/// Aggregate statistics over the store.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total_conversations: i64,
    pub total_messages: i64,
    pub total_topics: i64,
    pub messages_by_role: BTreeMap<String, i64>,
    pub messages_last_7_days: i64,
    pub top_models: Vec<ModelCount>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelCount {
    pub model: String,
    pub count: i64,
}

/// Events delivered to observers after a write commits.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "event")]
pub enum StoreEvent {
    ConversationCreated { conversation_id: i64 },
    MessageAppended { conversation_id: i64, message_id: i64 },
    ConversationDeleted { conversation_id: i64 },
    TitleChanged { conversation_id: i64 },
}

pub struct ConversationStore {
    pool: SqlitePool,
    observers: Mutex<Vec<mpsc::UnboundedSender<StoreEvent>>>,
}

impl ConversationStore {
    /// Open (creating if missing) the store at the given path and apply the
    /// schema.
    pub async fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RouterError::Store(format!("cannot create data directory: {e}")))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        Self::open_with(options).await
    }

    /// In-memory store for tests.
    pub async fn open_in_memory() -> AppResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| RouterError::Store(e.to_string()))?
            .foreign_keys(true);
        Self::open_with(options).await
    }

    async fn open_with(options: SqliteConnectOptions) -> AppResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| RouterError::Store(format!("cannot open store: {e}")))?;

        let store = Self {
            pool,
            observers: Mutex::new(Vec::new()),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> AppResult<()> {
        let schema = include_str!("schema.sql");

        // SQLite executes one statement at a time; split on statement
        // boundaries, keeping trigger bodies (BEGIN ... END) intact.
        let mut statements = Vec::new();
        let mut current = String::new();
        let mut in_trigger = false;
        for line in schema.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with("--") {
                continue;
            }
            current.push_str(line);
            current.push('\n');
            let upper = trimmed.to_uppercase();
            if upper.starts_with("CREATE TRIGGER") {
                in_trigger = true;
            }
            if in_trigger {
                if upper.starts_with("END;") {
                    statements.push(current.trim().to_string());
                    current.clear();
                    in_trigger = false;
                }
            } else if trimmed.ends_with(';') {
                statements.push(current.trim().to_string());
                current.clear();
            }
        }

        for statement in statements {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    RouterError::Store(format!(
                        "schema statement failed ({}...): {e}",
                        statement.chars().take(60).collect::<String>()
                    ))
                })?;
        }
        Ok(())
    }

    /// Register an observer. Events are sent after the write commits;
    /// closed receivers are pruned on the next notification.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StoreEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers
            .lock()
            .expect("observer lock poisoned")
            .push(tx);
        rx
    }

    fn notify(&self, event: StoreEvent) {
        let mut observers = self.observers.lock().expect("observer lock poisoned");
        observers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn now() -> String {
        Utc::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
    }

    // ── Topics ──────────────────────────────────────────────────────────

    /// Create a topic. Name uniqueness is enforced here, not by callers.
    pub async fn create_topic(&self, name: &str, parent_id: Option<i64>) -> AppResult<i64> {
        if name.trim().is_empty() {
            return Err(RouterError::Validation(
                "topic name cannot be empty".to_string(),
            ));
        }
        let result = sqlx::query(
            "INSERT INTO topics (name, parent_id, created_at) VALUES (?1, ?2, ?3)",
        )
        .bind(name)
        .bind(parent_id)
        .bind(Self::now())
        .execute(&self.pool)
        .await;

        match result {
            Ok(r) => Ok(r.last_insert_rowid()),
            Err(e) if e.to_string().contains("UNIQUE") => Err(RouterError::Validation(format!(
                "topic '{name}' already exists"
            ))),
            Err(e) => Err(RouterError::Store(format!("create_topic: {e}"))),
        }
    }

    /// Find a topic by name, or create it. Import relies on this to reuse
    /// topics instead of duplicating them.
    pub async fn get_or_create_topic(&self, name: &str) -> AppResult<i64> {
        let existing = sqlx::query("SELECT id FROM topics WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RouterError::Store(format!("get_or_create_topic: {e}")))?;
        match existing {
            Some(row) => Ok(row.get::<i64, _>("id")),
            None => self.create_topic(name, None).await,
        }
    }

    pub async fn list_topics(&self) -> AppResult<Vec<Topic>> {
        let rows = sqlx::query(
            "SELECT id, name, parent_id, created_at FROM topics ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RouterError::Store(format!("list_topics: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|row| Topic {
                id: row.get("id"),
                name: row.get("name"),
                parent_id: row.get("parent_id"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    // ── Conversations ───────────────────────────────────────────────────

    pub async fn create_conversation(
        &self,
        title: &str,
        topic_id: Option<i64>,
    ) -> AppResult<i64> {
        let now = Self::now();
        let result = sqlx::query(
            "INSERT INTO conversations (title, topic_id, status, created_at, updated_at) \
             VALUES (?1, ?2, 'active', ?3, ?3)",
        )
        .bind(title)
        .bind(topic_id)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| RouterError::Store(format!("create_conversation: {e}")))?;

        let id = result.last_insert_rowid();
        self.notify(StoreEvent::ConversationCreated {
            conversation_id: id,
        });
        Ok(id)
    }

    pub async fn get_conversation(&self, id: i64) -> AppResult<Option<Conversation>> {
        let row = sqlx::query(
            "SELECT c.id, c.title, c.topic_id, t.name AS topic_name, c.status, \
                    c.created_at, c.updated_at, \
                    (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id) AS message_count \
             FROM conversations c \
             LEFT JOIN topics t ON c.topic_id = t.id \
             WHERE c.id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RouterError::Store(format!("get_conversation: {e}")))?;

        row.map(Self::conversation_from_row).transpose()
    }

    fn conversation_from_row(row: sqlx::sqlite::SqliteRow) -> AppResult<Conversation> {
        let status: String = row.get("status");
        Ok(Conversation {
            id: row.get("id"),
            title: row.get("title"),
            topic_id: row.get("topic_id"),
            topic_name: row.get("topic_name"),
            status: status.parse()?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            message_count: row.get("message_count"),
        })
    }

    pub async fn list_conversations(
        &self,
        filters: &ConversationFilters,
    ) -> AppResult<Vec<Conversation>> {
        let mut sql = String::from(
            "SELECT c.id, c.title, c.topic_id, t.name AS topic_name, c.status, \
                    c.created_at, c.updated_at, \
                    (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id) AS message_count \
             FROM conversations c \
             LEFT JOIN topics t ON c.topic_id = t.id \
             WHERE 1=1",
        );
        if filters.topic_id.is_some() {
            sql.push_str(" AND c.topic_id = ?");
        }
        if filters.status.is_some() {
            sql.push_str(" AND c.status = ?");
        }
        let direction = if filters.ascending { "ASC" } else { "DESC" };
        sql.push_str(&format!(
            " ORDER BY {} {direction} LIMIT ? OFFSET ?",
            filters.sort.as_sql()
        ));

        let mut query = sqlx::query(&sql);
        if let Some(topic_id) = filters.topic_id {
            query = query.bind(topic_id);
        }
        if let Some(status) = filters.status {
            query = query.bind(status.as_str());
        }
        query = query
            .bind(filters.limit.unwrap_or(100))
            .bind(filters.offset.unwrap_or(0));
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RouterError::Store(format!("list_conversations: {e}")))?;

        rows.into_iter().map(Self::conversation_from_row).collect()
    }

    pub async fn rename_conversation(&self, id: i64, title: &str) -> AppResult<bool> {
        let result = sqlx::query("UPDATE conversations SET title = ?1 WHERE id = ?2")
            .bind(title)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| RouterError::Store(format!("rename_conversation: {e}")))?;
        let changed = result.rows_affected() > 0;
        if changed {
            self.notify(StoreEvent::TitleChanged {
                conversation_id: id,
            });
        }
        Ok(changed)
    }

    pub async fn set_status(&self, id: i64, status: ConversationStatus) -> AppResult<bool> {
        let result = sqlx::query("UPDATE conversations SET status = ?1 WHERE id = ?2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| RouterError::Store(format!("set_status: {e}")))?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a conversation; its messages go with it.
    pub async fn delete_conversation(&self, id: i64) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM conversations WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| RouterError::Store(format!("delete_conversation: {e}")))?;
        let deleted = result.rows_affected() > 0;
        if deleted {
            self.notify(StoreEvent::ConversationDeleted {
                conversation_id: id,
            });
        }
        Ok(deleted)
    }

    // ── Messages ────────────────────────────────────────────────────────

    /// Append one message. Messages are append-only: there is no edit and
    /// no single-message delete.
    pub async fn append_message(
        &self,
        conversation_id: i64,
        role: Role,
        content: &str,
        model_ref: Option<&str>,
    ) -> AppResult<i64> {
        self.append_message_at(conversation_id, role, content, model_ref, &Self::now())
            .await
    }

    /// Append with an explicit timestamp; import uses this to preserve
    /// original message times.
    pub async fn append_message_at(
        &self,
        conversation_id: i64,
        role: Role,
        content: &str,
        model_ref: Option<&str>,
        timestamp: &str,
    ) -> AppResult<i64> {
        if role == Role::Assistant && model_ref.is_none() {
            return Err(RouterError::Validation(
                "assistant messages must carry a model reference".to_string(),
            ));
        }

        let exists = sqlx::query("SELECT 1 FROM conversations WHERE id = ?1")
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RouterError::Store(format!("append_message: {e}")))?;
        if exists.is_none() {
            return Err(RouterError::NotFound(format!(
                "conversation {conversation_id} does not exist"
            )));
        }

        let result = sqlx::query(
            "INSERT INTO messages (conversation_id, role, content, model_ref, timestamp) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(conversation_id)
        .bind(role.as_str())
        .bind(content)
        .bind(model_ref)
        .bind(timestamp)
        .execute(&self.pool)
        .await
        .map_err(|e| RouterError::Store(format!("append_message: {e}")))?;

        let id = result.last_insert_rowid();
        self.notify(StoreEvent::MessageAppended {
            conversation_id,
            message_id: id,
        });
        Ok(id)
    }

    pub async fn get_messages(
        &self,
        conversation_id: i64,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> AppResult<Vec<MessageRecord>> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, role, content, model_ref, timestamp \
             FROM messages WHERE conversation_id = ?1 \
             ORDER BY timestamp ASC, id ASC LIMIT ?2 OFFSET ?3",
        )
        .bind(conversation_id)
        .bind(limit.unwrap_or(-1))
        .bind(offset.unwrap_or(0))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RouterError::Store(format!("get_messages: {e}")))?;

        rows.into_iter()
            .map(|row| {
                let role: String = row.get("role");
                Ok(MessageRecord {
                    id: row.get("id"),
                    conversation_id: row.get("conversation_id"),
                    role: role.parse()?,
                    content: row.get("content"),
                    model_ref: row.get("model_ref"),
                    timestamp: row.get("timestamp"),
                })
            })
            .collect()
    }

    // ── Search ──────────────────────────────────────────────────────────

    /// Substring search across message content and conversation titles,
    /// ranked by match count then recency.
    pub async fn search_conversations(
        &self,
        needle: &str,
        filters: &ConversationFilters,
    ) -> AppResult<Vec<SearchHit>> {
        let pattern = format!("%{}%", needle.replace('%', "\\%").replace('_', "\\_"));

        let mut sql = String::from(
            "SELECT c.id, c.title, c.topic_id, t.name AS topic_name, c.status, \
                    c.created_at, c.updated_at, \
                    (SELECT COUNT(*) FROM messages m2 WHERE m2.conversation_id = c.id) AS message_count, \
                    COUNT(m.id) AS match_count \
             FROM conversations c \
             LEFT JOIN topics t ON c.topic_id = t.id \
             JOIN messages m ON m.conversation_id = c.id \
             WHERE (m.content LIKE ?1 ESCAPE '\\' OR c.title LIKE ?1 ESCAPE '\\')",
        );
        if filters.topic_id.is_some() {
            sql.push_str(" AND c.topic_id = ?");
        }
        if filters.status.is_some() {
            sql.push_str(" AND c.status = ?");
        }
        if filters.date_from.is_some() {
            sql.push_str(" AND m.timestamp >= ?");
        }
        if filters.date_to.is_some() {
            sql.push_str(" AND m.timestamp <= ?");
        }
        sql.push_str(" GROUP BY c.id ORDER BY match_count DESC, c.updated_at DESC");

        let mut query = sqlx::query(&sql).bind(pattern);
        if let Some(topic_id) = filters.topic_id {
            query = query.bind(topic_id);
        }
        if let Some(status) = filters.status {
            query = query.bind(status.as_str());
        }
        if let Some(from) = filters.date_from.clone() {
            query = query.bind(from);
        }
        if let Some(to) = filters.date_to.clone() {
            query = query.bind(to);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RouterError::Store(format!("search_conversations: {e}")))?;

        rows.into_iter()
            .map(|row| {
                let match_count: i64 = row.get("match_count");
                Ok(SearchHit {
                    conversation: Self::conversation_from_row(row)?,
                    match_count,
                })
            })
            .collect()
    }

    // ── Statistics ──────────────────────────────────────────────────────

    pub async fn stats(&self) -> AppResult<StoreStats> {
        let scalar = |sql: &'static str| async move {
            sqlx::query(sql)
                .fetch_one(&self.pool)
                .await
                .map(|row| row.get::<i64, _>(0))
                .map_err(|e| RouterError::Store(format!("stats: {e}")))
        };

        let total_conversations = scalar("SELECT COUNT(*) FROM conversations").await?;
        let total_messages = scalar("SELECT COUNT(*) FROM messages").await?;
        let total_topics = scalar("SELECT COUNT(*) FROM topics").await?;

        let role_rows = sqlx::query("SELECT role, COUNT(*) AS n FROM messages GROUP BY role")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RouterError::Store(format!("stats: {e}")))?;
        let messages_by_role = role_rows
            .into_iter()
            .map(|row| (row.get::<String, _>("role"), row.get::<i64, _>("n")))
            .collect();

        let week_ago = (Utc::now() - chrono::Duration::days(7))
            .format("%Y-%m-%d %H:%M:%S%.3f")
            .to_string();
        let messages_last_7_days =
            sqlx::query("SELECT COUNT(*) FROM messages WHERE timestamp >= ?1")
                .bind(&week_ago)
                .fetch_one(&self.pool)
                .await
                .map(|row| row.get::<i64, _>(0))
                .map_err(|e| RouterError::Store(format!("stats: {e}")))?;

        let model_rows = sqlx::query(
            "SELECT model_ref, COUNT(*) AS n FROM messages \
             WHERE model_ref IS NOT NULL GROUP BY model_ref ORDER BY n DESC LIMIT 5",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RouterError::Store(format!("stats: {e}")))?;
        let top_models = model_rows
            .into_iter()
            .map(|row| ModelCount {
                model: row.get("model_ref"),
                count: row.get("n"),
            })
            .collect();

        Ok(StoreStats {
            total_conversations,
            total_messages,
            total_topics,
            messages_by_role,
            messages_last_7_days,
            top_models,
        })
    }
}
