//! 消息 DTO（REST 行、插入请求、字段补丁、变更通知）

use crate::im::serialization::deserialize_null_default;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 远端消息行（数据库表 `messages` 的一行）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub content: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

/// 插入请求
///
/// `created_at` 由客户端生成并随请求写入，服务端回显时保持不变，
/// 这样确认后的消息在列表中的位置与乐观插入时一致。
#[derive(Debug, Clone, Serialize)]
pub struct NewMessage {
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// 消息字段补丁（只序列化有值的字段）
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MessagePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_read: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl MessagePatch {
    pub fn read() -> Self {
        Self {
            is_read: Some(true),
            content: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.is_read.is_none() && self.content.is_none()
    }
}

/// 本地存储产生的变更通知（供进程内变更源转发）
#[derive(Debug, Clone, PartialEq)]
pub enum MessageChange {
    Inserted(MessageRow),
    Updated(MessageRow),
}

impl MessageChange {
    pub fn row(&self) -> &MessageRow {
        match self {
            MessageChange::Inserted(row) | MessageChange::Updated(row) => row,
        }
    }
}
