use crate::store::{format_ts, get_ts, is_unique_violation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Pool, Row, Sqlite};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConversationStatus {
    Active,
    Closed,
    Archived,
}

impl ConversationStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(Self::Active),
            "CLOSED" => Some(Self::Closed),
            "ARCHIVED" => Some(Self::Archived),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Closed => "CLOSED",
            Self::Archived => "ARCHIVED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "USER" => Some(Self::User),
            "ASSISTANT" => Some(Self::Assistant),
            "SYSTEM" => Some(Self::System),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Assistant => "ASSISTANT",
            Self::System => "SYSTEM",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub bot_id: String,
    pub user_id: String,
    pub user_name: Option<String>,
    pub user_email: Option<String>,
    pub status: ConversationStatus,
    #[serde(rename = "difyConversationId")]
    pub upstream_conversation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(rename = "difyMessageId")]
    pub upstream_message_id: Option<String>,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Conversation row plus its message count, for admin listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub message_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversationError {
    #[error("conversation not found")]
    NotFound,
    #[error("{0}")]
    Storage(String),
}

impl From<sqlx::Error> for ConversationError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<String> for ConversationError {
    fn from(err: String) -> Self {
        Self::Storage(err)
    }
}

#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub role: MessageRole,
    pub content: &'a str,
    pub upstream_message_id: Option<&'a str>,
    pub metadata: Option<&'a Value>,
}

impl<'a> NewMessage<'a> {
    pub fn new(role: MessageRole, content: &'a str) -> Self {
        Self {
            role,
            content,
            upstream_message_id: None,
            metadata: None,
        }
    }

    pub fn with_upstream_id(mut self, id: Option<&'a str>) -> Self {
        self.upstream_message_id = id;
        self
    }

    pub fn with_metadata(mut self, metadata: Option<&'a Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

const CONVERSATION_COLUMNS: &str = "id, bot_id, user_id, user_name, user_email, status, upstream_conversation_id, created_at, updated_at";
const MESSAGE_COLUMNS: &str =
    "id, conversation_id, role, content, upstream_message_id, metadata, created_at";

#[derive(Clone)]
pub struct ConversationStore {
    pool: Pool<Sqlite>,
}

impl ConversationStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                bot_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                user_name TEXT,
                user_email TEXT,
                status TEXT NOT NULL DEFAULT 'ACTIVE',
                upstream_conversation_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (bot_id) REFERENCES bots(id) ON DELETE CASCADE
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        // At most one ACTIVE conversation per (bot, user).
        sqlx::query(
            r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_active_pair
               ON conversations(bot_id, user_id) WHERE status = 'ACTIVE'"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                upstream_message_id TEXT,
                metadata TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, created_at)",
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    pub async fn get(&self, id: &str) -> Result<Option<Conversation>, String> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        row.as_ref().map(row_to_conversation).transpose()
    }

    async fn find_active(&self, bot_id: &str, user_id: &str) -> Result<Option<Conversation>, String> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE bot_id = ? AND user_id = ? AND status = 'ACTIVE'"
        ))
        .bind(bot_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        row.as_ref().map(row_to_conversation).transpose()
    }

    /// Returns the ACTIVE conversation for the pair, creating it when absent.
    ///
    /// The boolean is `true` only for the call that created the row. The welcome
    /// message is written in the same transaction as the conversation, so it exists
    /// exactly once. Losing a creation race to another caller re-fetches the winner.
    pub async fn get_or_create_active(
        &self,
        bot_id: &str,
        user_id: &str,
        user_name: Option<&str>,
        user_email: Option<&str>,
        welcome_message: Option<&str>,
    ) -> Result<(Conversation, bool), String> {
        if let Some(existing) = self.find_active(bot_id, user_id).await? {
            return Ok((existing, false));
        }

        let now = Utc::now();
        let conversation = Conversation {
            id: uuid::Uuid::new_v4().to_string(),
            bot_id: bot_id.to_string(),
            user_id: user_id.to_string(),
            user_name: user_name.map(str::to_string),
            user_email: user_email.map(str::to_string),
            status: ConversationStatus::Active,
            upstream_conversation_id: None,
            created_at: now,
            updated_at: now,
        };

        let mut tx = self.pool.begin().await.map_err(|e| e.to_string())?;
        let inserted = sqlx::query(
            r#"INSERT INTO conversations (id, bot_id, user_id, user_name, user_email, status, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, 'ACTIVE', ?, ?)"#,
        )
        .bind(&conversation.id)
        .bind(&conversation.bot_id)
        .bind(&conversation.user_id)
        .bind(&conversation.user_name)
        .bind(&conversation.user_email)
        .bind(format_ts(now))
        .bind(format_ts(now))
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                drop(tx);
                tracing::debug!(bot_id, user_id, "active conversation created concurrently, re-fetching");
                let winner = self
                    .find_active(bot_id, user_id)
                    .await?
                    .ok_or_else(|| "active conversation vanished after conflict".to_string())?;
                return Ok((winner, false));
            }
            Err(err) => return Err(err.to_string()),
        }

        if let Some(welcome) = welcome_message.filter(|w| !w.trim().is_empty()) {
            sqlx::query(
                r#"INSERT INTO messages (id, conversation_id, role, content, created_at)
                   VALUES (?, ?, 'ASSISTANT', ?, ?)"#,
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(&conversation.id)
            .bind(welcome)
            .bind(format_ts(now))
            .execute(&mut *tx)
            .await
            .map_err(|e| e.to_string())?;
        }

        tx.commit().await.map_err(|e| e.to_string())?;
        tracing::info!(conversation_id = %conversation.id, bot_id, user_id, "conversation created");
        Ok((conversation, true))
    }

    /// Append-only insert. Fails with `NotFound` when the conversation row is gone.
    pub async fn append_message(
        &self,
        conversation_id: &str,
        message: NewMessage<'_>,
    ) -> Result<Message, ConversationError> {
        let now = Utc::now();
        let id = uuid::Uuid::new_v4().to_string();
        let metadata_text = message.metadata.map(Value::to_string);

        let result = sqlx::query(
            r#"INSERT INTO messages (id, conversation_id, role, content, upstream_message_id, metadata, created_at)
               SELECT ?, id, ?, ?, ?, ?, ? FROM conversations WHERE id = ?"#,
        )
        .bind(&id)
        .bind(message.role.as_str())
        .bind(message.content)
        .bind(message.upstream_message_id)
        .bind(&metadata_text)
        .bind(format_ts(now))
        .bind(conversation_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ConversationError::NotFound);
        }

        sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(format_ts(now))
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;

        Ok(Message {
            id,
            conversation_id: conversation_id.to_string(),
            role: message.role,
            content: message.content.to_string(),
            upstream_message_id: message.upstream_message_id.map(str::to_string),
            metadata: message.metadata.cloned(),
            created_at: now,
        })
    }

    /// Moves the conversation to CLOSED. Closing an already closed conversation succeeds.
    pub async fn close(&self, id: &str) -> Result<Conversation, ConversationError> {
        sqlx::query("UPDATE conversations SET status = 'CLOSED', updated_at = ? WHERE id = ? AND status != 'CLOSED'")
            .bind(format_ts(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        self.get(id).await?.ok_or(ConversationError::NotFound)
    }

    /// Sets the upstream handle if none is recorded yet. Returns whether this call set it.
    pub async fn record_upstream_handle(&self, id: &str, handle: &str) -> Result<bool, String> {
        if handle.is_empty() {
            return Ok(false);
        }
        let result = sqlx::query(
            r#"UPDATE conversations SET upstream_conversation_id = ?, updated_at = ?
               WHERE id = ? AND upstream_conversation_id IS NULL"#,
        )
        .bind(handle)
        .bind(format_ts(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(result.rows_affected() > 0)
    }

    /// Messages in creation order; insertion order breaks timestamp ties.
    pub async fn list_messages(
        &self,
        conversation_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>, String> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, rowid ASC LIMIT ? OFFSET ?"
        ))
        .bind(conversation_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        rows.iter().map(row_to_message).collect()
    }

    pub async fn count_messages(&self, conversation_id: &str) -> Result<i64, String> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM messages WHERE conversation_id = ?")
            .bind(conversation_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        row.try_get("count").map_err(|e| e.to_string())
    }

    pub async fn list_by_bot(
        &self,
        bot_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<ConversationSummary>, i64), String> {
        let total: i64 = sqlx::query("SELECT COUNT(*) as count FROM conversations WHERE bot_id = ?")
            .bind(bot_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| e.to_string())?
            .try_get("count")
            .map_err(|e| e.to_string())?;

        let rows = sqlx::query(
            r#"SELECT c.id, c.bot_id, c.user_id, c.user_name, c.user_email, c.status,
                      c.upstream_conversation_id, c.created_at, c.updated_at,
                      (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id) as message_count
               FROM conversations c
               WHERE c.bot_id = ?
               ORDER BY c.updated_at DESC, c.rowid DESC
               LIMIT ? OFFSET ?"#,
        )
        .bind(bot_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        let items = rows
            .iter()
            .map(|row| {
                Ok(ConversationSummary {
                    conversation: row_to_conversation(row)?,
                    message_count: row.try_get("message_count").map_err(|e| e.to_string())?,
                })
            })
            .collect::<Result<Vec<_>, String>>()?;
        Ok((items, total))
    }
}

fn row_to_conversation(row: &sqlx::sqlite::SqliteRow) -> Result<Conversation, String> {
    let status_str: String = row.try_get("status").map_err(|e| e.to_string())?;
    let status = ConversationStatus::from_str(&status_str)
        .ok_or_else(|| format!("invalid conversation status: {status_str}"))?;
    Ok(Conversation {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        bot_id: row.try_get("bot_id").map_err(|e| e.to_string())?,
        user_id: row.try_get("user_id").map_err(|e| e.to_string())?,
        user_name: row.try_get("user_name").map_err(|e| e.to_string())?,
        user_email: row.try_get("user_email").map_err(|e| e.to_string())?,
        status,
        upstream_conversation_id: row
            .try_get("upstream_conversation_id")
            .map_err(|e| e.to_string())?,
        created_at: get_ts(row, "created_at")?,
        updated_at: get_ts(row, "updated_at")?,
    })
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<Message, String> {
    let role_str: String = row.try_get("role").map_err(|e| e.to_string())?;
    let role =
        MessageRole::from_str(&role_str).ok_or_else(|| format!("invalid message role: {role_str}"))?;
    let metadata: Option<String> = row.try_get("metadata").map_err(|e| e.to_string())?;
    let metadata = metadata
        .as_deref()
        .map(serde_json::from_str::<Value>)
        .transpose()
        .map_err(|e| e.to_string())?;
    Ok(Message {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        conversation_id: row.try_get("conversation_id").map_err(|e| e.to_string())?,
        role,
        content: row.try_get("content").map_err(|e| e.to_string())?,
        upstream_message_id: row
            .try_get("upstream_message_id")
            .map_err(|e| e.to_string())?,
        metadata,
        created_at: get_ts(row, "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::connect_pool;

    async fn store() -> ConversationStore {
        let pool = connect_pool("sqlite::memory:").await.unwrap();
        sqlx::query("CREATE TABLE bots (id TEXT PRIMARY KEY)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO bots (id) VALUES ('b1')")
            .execute(&pool)
            .await
            .unwrap();
        ConversationStore::new(pool).await.unwrap()
    }

    #[tokio::test]
    async fn get_or_create_reuses_active_row_and_welcomes_once() {
        let store = store().await;
        let (first, created) = store
            .get_or_create_active("b1", "u1", None, None, Some("welcome"))
            .await
            .unwrap();
        assert!(created);
        let (second, created_again) = store
            .get_or_create_active("b1", "u1", None, None, Some("welcome"))
            .await
            .unwrap();
        assert!(!created_again);
        assert_eq!(first.id, second.id);
        assert_eq!(store.count_messages(&first.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn closing_frees_the_pair_for_a_new_conversation() {
        let store = store().await;
        let (first, _) = store
            .get_or_create_active("b1", "u1", None, None, None)
            .await
            .unwrap();
        let closed = store.close(&first.id).await.unwrap();
        assert_eq!(closed.status, ConversationStatus::Closed);
        let again = store.close(&first.id).await.unwrap();
        assert_eq!(again.status, ConversationStatus::Closed);

        let (next, created) = store
            .get_or_create_active("b1", "u1", None, None, None)
            .await
            .unwrap();
        assert!(created);
        assert_ne!(next.id, first.id);
    }

    #[tokio::test]
    async fn upstream_handle_is_recorded_once() {
        let store = store().await;
        let (conv, _) = store
            .get_or_create_active("b1", "u1", None, None, None)
            .await
            .unwrap();
        assert!(store.record_upstream_handle(&conv.id, "up1").await.unwrap());
        assert!(!store.record_upstream_handle(&conv.id, "up2").await.unwrap());
        let reloaded = store.get(&conv.id).await.unwrap().unwrap();
        assert_eq!(reloaded.upstream_conversation_id.as_deref(), Some("up1"));
    }

    #[tokio::test]
    async fn append_to_missing_conversation_is_not_found() {
        let store = store().await;
        let err = store
            .append_message("missing", NewMessage::new(MessageRole::User, "hi"))
            .await
            .unwrap_err();
        assert_eq!(err, ConversationError::NotFound);
    }

    #[tokio::test]
    async fn messages_keep_insertion_order() {
        let store = store().await;
        let (conv, _) = store
            .get_or_create_active("b1", "u1", None, None, None)
            .await
            .unwrap();
        for text in ["one", "two", "three"] {
            store
                .append_message(&conv.id, NewMessage::new(MessageRole::User, text))
                .await
                .unwrap();
        }
        let contents: Vec<String> = store
            .list_messages(&conv.id, 50, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
    }
}
