//! 会话消息同步监听器

use crate::im::message::models::ChatMessage;
use crate::im::realtime::SubscriptionState;
use async_trait::async_trait;

/// 会话消息同步回调接口
///
/// 回调在状态变更之后按发生顺序依次调用（不持有内部锁）。
#[async_trait]
pub trait MessageSyncListener: Send + Sync {
    /// 消息列表变化（乐观插入、确认、回滚、远端事件）
    ///
    /// 参数 `messages` 是变化后的完整列表快照
    async fn on_messages_changed(&self, messages: Vec<ChatMessage>);

    /// 初始拉取失败，列表保持为空
    async fn on_load_failed(&self, conversation_id: String, error: String);

    /// 发送失败，乐观插入的消息已回滚
    ///
    /// 参数 `placeholder_id` 是被回滚消息的占位 ID
    async fn on_send_failed(&self, placeholder_id: String, error: String);

    /// 订阅状态变化（`Failed` 为终态，需要重新打开会话）
    async fn on_sync_state_changed(&self, state: SubscriptionState);
}

/// 空实现（默认监听器）
pub struct EmptyMessageSyncListener;

#[async_trait]
impl MessageSyncListener for EmptyMessageSyncListener {
    async fn on_messages_changed(&self, _messages: Vec<ChatMessage>) {}
    async fn on_load_failed(&self, _conversation_id: String, _error: String) {}
    async fn on_send_failed(&self, _placeholder_id: String, _error: String) {}
    async fn on_sync_state_changed(&self, _state: SubscriptionState) {}
}
