// ABOUTME: SQLite storage for conversations and their messages
// ABOUTME: Idempotency keys are enforced by unique indexes, with lookups that absorb insert races

use crate::types::{
    ContentBlock, Conversation, ConversationStatus, DeliveryStatus, Message, MessageRole,
};
use chrono::{DateTime, Utc};
use fleet_storage::{from_db_timestamp, to_db_timestamp, Result, StorageError};
use sqlx::{Row, SqlitePool};
use tracing::debug;

const CONVERSATION_COLUMNS: &str = "id, team_id, user_id, session_id, agent_provider, cwd, \
    status, sandbox_id, client_key, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, seq, role, content, delivery_status, \
    attempt_count, client_key, error_message, created_at";

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Fields needed to open a conversation
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub team_id: String,
    pub user_id: String,
    pub agent_provider: String,
    pub cwd: String,
    pub client_key: String,
    pub sandbox_id: Option<String>,
    pub status: ConversationStatus,
}

#[derive(Clone)]
pub struct ConversationStore {
    pool: SqlitePool,
}

impl ConversationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ========================================================================
    // CONVERSATIONS
    // ========================================================================

    /// Insert a conversation, or return the open one that already holds its key.
    /// The boolean is true when a new row was written.
    pub async fn create_conversation(&self, new: NewConversation) -> Result<(Conversation, bool)> {
        let now = Utc::now();
        let id = format!("conv_{}", uuid::Uuid::new_v4().simple());
        let conversation = Conversation {
            session_id: format!("sess_{}", uuid::Uuid::new_v4().simple()),
            id,
            team_id: new.team_id,
            user_id: new.user_id,
            agent_provider: new.agent_provider,
            cwd: new.cwd,
            status: new.status,
            sandbox_id: new.sandbox_id,
            client_key: new.client_key,
            created_at: now,
            updated_at: now,
        };

        let inserted = sqlx::query(
            r#"
            INSERT INTO conversations (
                id, team_id, user_id, session_id, agent_provider, cwd,
                status, sandbox_id, client_key, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(&conversation.id)
        .bind(&conversation.team_id)
        .bind(&conversation.user_id)
        .bind(&conversation.session_id)
        .bind(&conversation.agent_provider)
        .bind(&conversation.cwd)
        .bind(conversation.status.as_str())
        .bind(&conversation.sandbox_id)
        .bind(&conversation.client_key)
        .bind(to_db_timestamp(&now))
        .bind(to_db_timestamp(&now))
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok((conversation, true)),
            Err(e) if is_unique_violation(&e) => {
                debug!(client_key = %conversation.client_key, "Conversation key raced, returning existing");
                let existing = self
                    .find_open_conversation(&conversation.team_id, &conversation.client_key)
                    .await?
                    .ok_or_else(|| StorageError::NotFound(conversation.client_key.clone()))?;
                Ok((existing, false))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn find_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM conversations WHERE id = ?1",
            CONVERSATION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_conversation).transpose()
    }

    pub async fn find_open_conversation(
        &self,
        team_id: &str,
        client_key: &str,
    ) -> Result<Option<Conversation>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM conversations WHERE team_id = ?1 AND client_key = ?2 AND status != 'closed'",
            CONVERSATION_COLUMNS
        ))
        .bind(team_id)
        .bind(client_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_conversation).transpose()
    }

    pub async fn list_open_conversations(&self) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM conversations WHERE status != 'closed' ORDER BY created_at ASC",
            CONVERSATION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_conversation).collect()
    }

    pub async fn set_conversation_status(
        &self,
        id: &str,
        status: ConversationStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE conversations SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status != 'closed'",
        )
        .bind(status.as_str())
        .bind(to_db_timestamp(&Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_conversation_sandbox(&self, id: &str, sandbox_id: &str) -> Result<()> {
        sqlx::query("UPDATE conversations SET sandbox_id = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(sandbox_id)
            .bind(to_db_timestamp(&Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Close a non-closed conversation. False if it was already closed or missing.
    pub async fn close_conversation(&self, id: &str) -> Result<bool> {
        self.set_conversation_status(id, ConversationStatus::Closed)
            .await
    }

    // ========================================================================
    // MESSAGES
    // ========================================================================

    /// Append a message with the next sequence number, or return the message that
    /// already holds `client_key` in this conversation. The boolean is true when a
    /// new row was written.
    pub async fn insert_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: &[ContentBlock],
        client_key: &str,
        status: DeliveryStatus,
    ) -> Result<(Message, bool)> {
        if let Some(existing) = self
            .find_message_by_client_key(conversation_id, client_key)
            .await?
        {
            return Ok((existing, false));
        }

        let id = format!("msg_{}", uuid::Uuid::new_v4().simple());
        let content_json = serde_json::to_string(content)?;
        let now = Utc::now();

        let inserted = sqlx::query(
            r#"
            INSERT INTO messages (
                id, conversation_id, seq, role, content, delivery_status,
                attempt_count, client_key, error_message, created_at
            )
            SELECT ?1, ?2, COALESCE(MAX(seq), 0) + 1, ?3, ?4, ?5, 0, ?6, NULL, ?7
            FROM messages WHERE conversation_id = ?2
            "#,
        )
        .bind(&id)
        .bind(conversation_id)
        .bind(role.as_str())
        .bind(&content_json)
        .bind(status.as_str())
        .bind(client_key)
        .bind(to_db_timestamp(&now))
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {
                let message = self
                    .find_message(&id)
                    .await?
                    .ok_or_else(|| StorageError::NotFound(id.clone()))?;
                Ok((message, true))
            }
            Err(e) if is_unique_violation(&e) => {
                let existing = self
                    .find_message_by_client_key(conversation_id, client_key)
                    .await?
                    .ok_or_else(|| StorageError::NotFound(client_key.to_string()))?;
                Ok((existing, false))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn find_message(&self, id: &str) -> Result<Option<Message>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM messages WHERE id = ?1",
            MESSAGE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_message).transpose()
    }

    pub async fn find_message_by_client_key(
        &self,
        conversation_id: &str,
        client_key: &str,
    ) -> Result<Option<Message>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM messages WHERE conversation_id = ?1 AND client_key = ?2",
            MESSAGE_COLUMNS
        ))
        .bind(conversation_id)
        .bind(client_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_message).transpose()
    }

    pub async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM messages WHERE conversation_id = ?1 ORDER BY seq ASC",
            MESSAGE_COLUMNS
        ))
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_message).collect()
    }

    /// Messages of one role with `seq` greater than `after_seq`
    pub async fn messages_after(
        &self,
        conversation_id: &str,
        role: MessageRole,
        after_seq: i64,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM messages WHERE conversation_id = ?1 AND role = ?2 AND seq > ?3 ORDER BY seq ASC",
            MESSAGE_COLUMNS
        ))
        .bind(conversation_id)
        .bind(role.as_str())
        .bind(after_seq)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_message).collect()
    }

    /// User messages that still need delivering, oldest first
    pub async fn pending_deliveries(&self) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM messages WHERE role = 'user' AND delivery_status IN ('queued', 'delivering') ORDER BY created_at ASC, seq ASC",
            MESSAGE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_message).collect()
    }

    /// Whether a user message created before `seq` is still waiting to be delivered
    pub async fn has_earlier_undelivered(&self, conversation_id: &str, seq: i64) -> Result<bool> {
        let exists: i64 = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM messages
                WHERE conversation_id = ?1 AND role = 'user' AND seq < ?2
                  AND delivery_status IN ('queued', 'delivering')
            )
            "#,
        )
        .bind(conversation_id)
        .bind(seq)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists != 0)
    }

    /// Return messages left in flight by a previous process to the queue
    pub async fn reset_interrupted_deliveries(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE messages SET delivery_status = 'queued' WHERE role = 'user' AND delivery_status = 'delivering'",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Claim a queued message for one delivery attempt. Returns the new lifetime
    /// attempt count, or `None` if the message is missing, in flight, or final.
    pub async fn begin_attempt(&self, id: &str) -> Result<Option<u32>> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET delivery_status = 'delivering', attempt_count = attempt_count + 1
            WHERE id = ?1 AND delivery_status = 'queued'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        let count: i64 = sqlx::query_scalar("SELECT attempt_count FROM messages WHERE id = ?1")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(Some(count.max(0) as u32))
    }

    pub async fn mark_delivered(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE messages SET delivery_status = 'delivered', error_message = NULL
            WHERE id = ?1 AND delivery_status = 'delivering'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Return an in-flight message to the queue after a failed attempt
    pub async fn mark_requeued(&self, id: &str, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE messages SET delivery_status = 'queued', error_message = ?1
            WHERE id = ?2 AND delivery_status = 'delivering'
            "#,
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE messages SET delivery_status = 'failed', error_message = ?1
            WHERE id = ?2 AND delivery_status IN ('queued', 'delivering')
            "#,
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Manual retry: only a failed message goes back to the queue.
    pub async fn requeue_for_retry(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE messages SET delivery_status = 'queued', error_message = NULL
            WHERE id = ?1 AND delivery_status = 'failed'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

fn row_to_conversation(row: sqlx::sqlite::SqliteRow) -> Result<Conversation> {
    Ok(Conversation {
        id: row.get("id"),
        team_id: row.get("team_id"),
        user_id: row.get("user_id"),
        session_id: row.get("session_id"),
        agent_provider: row.get("agent_provider"),
        cwd: row.get("cwd"),
        status: ConversationStatus::from_str(&row.get::<String, _>("status"))?,
        sandbox_id: row.get("sandbox_id"),
        client_key: row.get("client_key"),
        created_at: from_db_timestamp(&row.get::<String, _>("created_at"))?,
        updated_at: from_db_timestamp(&row.get::<String, _>("updated_at"))?,
    })
}

fn row_to_message(row: sqlx::sqlite::SqliteRow) -> Result<Message> {
    let created_at: DateTime<Utc> = from_db_timestamp(&row.get::<String, _>("created_at"))?;
    Ok(Message {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        seq: row.get("seq"),
        role: MessageRole::from_str(&row.get::<String, _>("role"))?,
        content: serde_json::from_str(&row.get::<String, _>("content"))?,
        delivery_status: DeliveryStatus::from_str(&row.get::<String, _>("delivery_status"))?,
        attempt_count: row.get::<i64, _>("attempt_count").max(0) as u32,
        client_key: row.get("client_key"),
        error_message: row.get("error_message"),
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_storage::memory_pool;

    fn new_conversation(key: &str) -> NewConversation {
        NewConversation {
            team_id: "team_a".to_string(),
            user_id: "user_1".to_string(),
            agent_provider: "claude".to_string(),
            cwd: "/workspace".to_string(),
            client_key: key.to_string(),
            sandbox_id: None,
            status: ConversationStatus::Initializing,
        }
    }

    async fn setup() -> ConversationStore {
        ConversationStore::new(memory_pool().await.unwrap())
    }

    #[tokio::test]
    async fn test_one_open_conversation_per_key() {
        let store = setup().await;

        let (first, created) = store
            .create_conversation(new_conversation("k1"))
            .await
            .unwrap();
        assert!(created);

        let (second, created) = store
            .create_conversation(new_conversation("k1"))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);

        // Closing frees the key
        assert!(store.close_conversation(&first.id).await.unwrap());
        assert!(!store.close_conversation(&first.id).await.unwrap());
        let (third, created) = store
            .create_conversation(new_conversation("k1"))
            .await
            .unwrap();
        assert!(created);
        assert_ne!(third.id, first.id);
    }

    #[tokio::test]
    async fn test_messages_are_sequenced_and_keyed() {
        let store = setup().await;
        let (conv, _) = store
            .create_conversation(new_conversation("k1"))
            .await
            .unwrap();

        let content = vec![ContentBlock::text("hello")];
        let (a, created) = store
            .insert_message(&conv.id, MessageRole::User, &content, "m1", DeliveryStatus::Queued)
            .await
            .unwrap();
        assert!(created);
        let (b, _) = store
            .insert_message(&conv.id, MessageRole::User, &content, "m2", DeliveryStatus::Queued)
            .await
            .unwrap();
        let (a_again, created) = store
            .insert_message(&conv.id, MessageRole::User, &content, "m1", DeliveryStatus::Queued)
            .await
            .unwrap();

        assert!(!created);
        assert_eq!(a_again.id, a.id);
        assert_eq!((a.seq, b.seq), (1, 2));
        assert_eq!(store.list_messages(&conv.id).await.unwrap().len(), 2);
        assert_eq!(a.content, content);
    }

    #[tokio::test]
    async fn test_delivery_status_transitions() {
        let store = setup().await;
        let (conv, _) = store
            .create_conversation(new_conversation("k1"))
            .await
            .unwrap();
        let (msg, _) = store
            .insert_message(
                &conv.id,
                MessageRole::User,
                &[ContentBlock::text("x")],
                "m1",
                DeliveryStatus::Queued,
            )
            .await
            .unwrap();

        assert_eq!(store.begin_attempt(&msg.id).await.unwrap(), Some(1));
        // Already in flight
        assert_eq!(store.begin_attempt(&msg.id).await.unwrap(), None);
        assert!(store.mark_requeued(&msg.id, "boom").await.unwrap());
        // Queued, not failed
        assert!(!store.requeue_for_retry(&msg.id).await.unwrap());
        assert_eq!(store.begin_attempt(&msg.id).await.unwrap(), Some(2));
        assert!(store.mark_delivered(&msg.id).await.unwrap());

        // Delivered is final
        assert_eq!(store.begin_attempt(&msg.id).await.unwrap(), None);
        assert!(!store.mark_failed(&msg.id, "late").await.unwrap());
        assert!(!store.requeue_for_retry(&msg.id).await.unwrap());

        let stored = store.find_message(&msg.id).await.unwrap().unwrap();
        assert_eq!(stored.delivery_status, DeliveryStatus::Delivered);
        assert_eq!(stored.attempt_count, 2);
        assert_eq!(stored.error_message, None);
    }

    #[tokio::test]
    async fn test_messages_after_filters_by_role() {
        let store = setup().await;
        let (conv, _) = store
            .create_conversation(new_conversation("k1"))
            .await
            .unwrap();

        for (i, role) in [MessageRole::User, MessageRole::Assistant, MessageRole::Assistant]
            .into_iter()
            .enumerate()
        {
            store
                .insert_message(
                    &conv.id,
                    role,
                    &[ContentBlock::text(format!("m{}", i))],
                    &format!("k{}", i),
                    DeliveryStatus::Delivered,
                )
                .await
                .unwrap();
        }

        let replies = store
            .messages_after(&conv.id, MessageRole::Assistant, 2)
            .await
            .unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].seq, 3);
        assert_eq!(replies[0].text(), "m2");
    }
}
