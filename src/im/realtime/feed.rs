//! 变更源（change feed）接口
//!
//! 推送式的回调被建模为消息通道：订阅成功后返回一个接收端，
//! 通道状态和插入/更新事件按传输层送达的顺序排队。

use crate::im::message::types::MessageRow;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// 订阅句柄 ID
pub type SubscriptionId = u64;

/// 事件通道容量
pub const FEED_CHANNEL_CAPACITY: usize = 256;

/// 通道状态（由平台层送达）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    Closed,
    ChannelError,
    TimedOut,
}

impl ChannelStatus {
    /// 是否表示连接已断开
    pub fn is_terminal(self) -> bool {
        !matches!(self, ChannelStatus::Subscribed)
    }
}

/// 变更源事件
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Status(ChannelStatus),
    Insert(MessageRow),
    Update(MessageRow),
}

/// 一次订阅：句柄 ID + 事件接收端
#[derive(Debug)]
pub struct FeedSubscription {
    pub id: SubscriptionId,
    pub events: mpsc::Receiver<FeedEvent>,
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// 订阅某个会话的消息变更
    ///
    /// 返回 `Ok` 只表示订阅请求已发出，真正可用以收到
    /// `FeedEvent::Status(ChannelStatus::Subscribed)` 为准。
    async fn subscribe(&self, conversation_id: &str) -> Result<FeedSubscription>;

    /// 取消订阅，重复调用无副作用
    async fn unsubscribe(&self, id: SubscriptionId);
}
