//! 消息数据存储接口

use crate::im::message::types::{MessagePatch, MessageRow, NewMessage};
use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// 拉取会话的全部消息，按创建时间升序
    async fn fetch_messages(&self, conversation_id: &str) -> Result<Vec<MessageRow>>;

    /// 插入一条消息，返回服务端确认后的行
    async fn insert_message(&self, message: &NewMessage) -> Result<MessageRow>;

    /// 按 ID 更新消息字段
    async fn update_message(&self, id: &str, patch: &MessagePatch) -> Result<()>;

    /// 把会话中其他人发送的未读消息标记为已读，返回受影响条数
    async fn mark_read(&self, conversation_id: &str, reader_id: &str) -> Result<u64>;
}
