//! 消息本地模型定义

use crate::im::message::types::MessageRow;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// 占位昵称（资料查询失败或尚未缓存时使用）
pub const PLACEHOLDER_DISPLAY_NAME: &str = "Unknown";

/// 消息投递状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DeliveryState {
    /// 本地乐观插入，尚未被远端确认（携带占位 ID）
    Pending,
    /// 已被远端确认（携带服务端 ID）
    Confirmed,
}

/// 发送者展示信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderProfile {
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl SenderProfile {
    pub fn placeholder() -> Self {
        Self {
            display_name: PLACEHOLDER_DISPLAY_NAME.to_string(),
            avatar_url: None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.display_name == PLACEHOLDER_DISPLAY_NAME && self.avatar_url.is_none()
    }
}

/// 会话中的一条消息（本地视图）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    pub delivery: DeliveryState,
    pub sender: SenderProfile,
}

impl ChatMessage {
    /// 由远端行构造已确认消息
    pub fn confirmed(row: MessageRow, sender: SenderProfile) -> Self {
        Self {
            id: row.id,
            conversation_id: row.conversation_id,
            sender_id: row.sender_id,
            content: row.content,
            is_read: row.is_read,
            created_at: row.created_at,
            delivery: DeliveryState::Confirmed,
            sender,
        }
    }

    /// 构造待确认消息
    pub fn pending(
        placeholder_id: String,
        conversation_id: String,
        sender_id: String,
        content: String,
        created_at: DateTime<Utc>,
        sender: SenderProfile,
    ) -> Self {
        Self {
            id: placeholder_id,
            conversation_id,
            sender_id,
            content,
            is_read: false,
            created_at,
            delivery: DeliveryState::Pending,
            sender,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.delivery == DeliveryState::Pending
    }
}
