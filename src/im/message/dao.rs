//! 消息数据访问层（DAO）
//!
//! 本地 SQLite 实现的消息存储。每次写入都会通过广播通道发布变更，
//! 供进程内回环变更源转发给订阅方。

use crate::im::message::repository::MessageRepository;
use crate::im::message::types::{MessageChange, MessagePatch, MessageRow, NewMessage};
use crate::im::serialization::generate_server_id;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};
use tokio::sync::broadcast;
use tracing::debug;

/// 变更广播容量
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

const SELECT_COLUMNS: &str = "id, conversation_id, sender_id, content, is_read, created_at";

pub struct MessageStore {
    pool: Pool<Sqlite>,
    changes: broadcast::Sender<MessageChange>,
}

impl MessageStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { pool, changes }
    }

    /// 变更广播发送端（用于构造回环变更源）
    pub fn change_sender(&self) -> broadcast::Sender<MessageChange> {
        self.changes.clone()
    }

    fn publish(&self, change: MessageChange) {
        // 没有订阅方时发送失败，忽略即可
        let _ = self.changes.send(change);
    }

    fn row_to_message(row: &SqliteRow) -> MessageRow {
        let created_ms: i64 = row.get("created_at");
        MessageRow {
            id: row.get("id"),
            conversation_id: row.get("conversation_id"),
            sender_id: row.get("sender_id"),
            content: row.get("content"),
            is_read: row.get::<i64, _>("is_read") != 0,
            created_at: DateTime::<Utc>::from_timestamp_millis(created_ms).unwrap_or_default(),
        }
    }

    pub async fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        let sql = format!("SELECT {} FROM messages WHERE id = ? LIMIT 1;", SELECT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(Self::row_to_message))
    }

    pub async fn count_unread(&self, conversation_id: &str, reader_id: &str) -> Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS cnt FROM messages
            WHERE conversation_id = ? AND sender_id != ? AND is_read = 0;
            "#,
        )
        .bind(conversation_id)
        .bind(reader_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("cnt"))
    }
}

#[async_trait]
impl MessageRepository for MessageStore {
    async fn fetch_messages(&self, conversation_id: &str) -> Result<Vec<MessageRow>> {
        let sql = format!(
            r#"
            SELECT {} FROM messages
            WHERE conversation_id = ?
            ORDER BY created_at ASC, rowid ASC;
            "#,
            SELECT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(conversation_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(Self::row_to_message).collect())
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<MessageRow> {
        let row = MessageRow {
            id: generate_server_id(),
            conversation_id: message.conversation_id.clone(),
            sender_id: message.sender_id.clone(),
            content: message.content.clone(),
            is_read: false,
            created_at: message.created_at,
        };
        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, sender_id, content, is_read, created_at)
            VALUES (?, ?, ?, ?, 0, ?);
            "#,
        )
        .bind(&row.id)
        .bind(&row.conversation_id)
        .bind(&row.sender_id)
        .bind(&row.content)
        .bind(row.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        debug!(
            "[MsgStore] 插入消息 id={}, conversationID={}",
            row.id, row.conversation_id
        );
        self.publish(MessageChange::Inserted(row.clone()));
        Ok(row)
    }

    async fn update_message(&self, id: &str, patch: &MessagePatch) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }
        let sql = format!(
            r#"
            UPDATE messages SET
                is_read = COALESCE(?, is_read),
                content = COALESCE(?, content)
            WHERE id = ?
            RETURNING {};
            "#,
            SELECT_COLUMNS
        );
        let updated = sqlx::query(&sql)
            .bind(patch.is_read.map(i64::from))
            .bind(&patch.content)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = updated {
            self.publish(MessageChange::Updated(Self::row_to_message(&row)));
        }
        Ok(())
    }

    async fn mark_read(&self, conversation_id: &str, reader_id: &str) -> Result<u64> {
        let sql = format!(
            r#"
            UPDATE messages SET is_read = 1
            WHERE conversation_id = ? AND sender_id != ? AND is_read = 0
            RETURNING {};
            "#,
            SELECT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(conversation_id)
            .bind(reader_id)
            .fetch_all(&self.pool)
            .await?;
        for row in &rows {
            self.publish(MessageChange::Updated(Self::row_to_message(row)));
        }
        Ok(rows.len() as u64)
    }
}
