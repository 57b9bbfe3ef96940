//! 进程内回环变更源
//!
//! 转发本地 SQLite 存储广播的变更，按会话过滤。用于离线/本地模式，
//! 也可以主动断开或拒绝订阅来演练重连流程。

use crate::im::message::types::MessageChange;
use crate::im::realtime::feed::{
    ChangeFeed, ChannelStatus, FeedEvent, FeedSubscription, SubscriptionId, FEED_CHANNEL_CAPACITY,
};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::PoisonError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct LocalChannel {
    control: mpsc::Sender<FeedEvent>,
    task: JoinHandle<()>,
}

pub struct LocalChangeFeed {
    changes: broadcast::Sender<MessageChange>,
    next_id: AtomicU64,
    available: AtomicBool,
    channels: std::sync::Mutex<HashMap<SubscriptionId, LocalChannel>>,
}

impl LocalChangeFeed {
    pub fn new(changes: broadcast::Sender<MessageChange>) -> Self {
        Self {
            changes,
            next_id: AtomicU64::new(1),
            available: AtomicBool::new(true),
            channels: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// 设置是否接受新订阅（`false` 时 `subscribe` 直接失败）
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// 断开所有订阅，每个订阅收到 `Closed`
    pub fn disconnect_all(&self) {
        let drained: Vec<(SubscriptionId, LocalChannel)> = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (id, channel) in drained {
            channel.task.abort();
            if channel
                .control
                .try_send(FeedEvent::Status(ChannelStatus::Closed))
                .is_err()
            {
                debug!("[LocalFeed] subscription={} 已无接收方", id);
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl ChangeFeed for LocalChangeFeed {
    async fn subscribe(&self, conversation_id: &str) -> Result<FeedSubscription> {
        if !self.available.load(Ordering::SeqCst) {
            anyhow::bail!("本地变更源不可用");
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut rx = self.changes.subscribe();
        let (tx, events) = mpsc::channel(FEED_CHANNEL_CAPACITY);
        // 新通道必有空位，订阅确认排在所有变更之前
        let _ = tx.try_send(FeedEvent::Status(ChannelStatus::Subscribed));

        let forward = tx.clone();
        let conversation_id = conversation_id.to_string();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(change) => {
                        if change.row().conversation_id != conversation_id {
                            continue;
                        }
                        let event = match change {
                            MessageChange::Inserted(row) => FeedEvent::Insert(row),
                            MessageChange::Updated(row) => FeedEvent::Update(row),
                        };
                        if forward.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("[LocalFeed] 变更积压，丢弃 {} 条", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        let _ = forward
                            .send(FeedEvent::Status(ChannelStatus::Closed))
                            .await;
                        break;
                    }
                }
            }
        });

        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, LocalChannel { control: tx, task });
        info!("[LocalFeed] ✅ 订阅成功 subscription={}", id);
        Ok(FeedSubscription { id, events })
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        let channel = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if let Some(channel) = channel {
            channel.task.abort();
            debug!("[LocalFeed] 已取消订阅 subscription={}", id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::message::types::MessageRow;
    use chrono::Utc;

    fn row(conversation_id: &str, id: &str) -> MessageRow {
        MessageRow {
            id: id.to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: "u1".to_string(),
            content: "hi".to_string(),
            is_read: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn forwards_only_matching_conversation() {
        let (changes, _) = broadcast::channel(16);
        let feed = LocalChangeFeed::new(changes.clone());
        let mut sub = feed.subscribe("c1").await.unwrap();

        assert_eq!(
            sub.events.recv().await,
            Some(FeedEvent::Status(ChannelStatus::Subscribed))
        );

        changes.send(MessageChange::Inserted(row("c2", "x"))).unwrap();
        changes.send(MessageChange::Inserted(row("c1", "m1"))).unwrap();
        changes.send(MessageChange::Updated(row("c1", "m1"))).unwrap();

        match sub.events.recv().await {
            Some(FeedEvent::Insert(r)) => assert_eq!(r.id, "m1"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(sub.events.recv().await, Some(FeedEvent::Update(_))));
    }

    #[tokio::test]
    async fn disconnect_all_delivers_closed() {
        let (changes, _) = broadcast::channel(16);
        let feed = LocalChangeFeed::new(changes);
        let mut sub = feed.subscribe("c1").await.unwrap();
        assert_eq!(feed.active_count(), 1);

        feed.disconnect_all();
        assert_eq!(feed.active_count(), 0);
        assert_eq!(
            sub.events.recv().await,
            Some(FeedEvent::Status(ChannelStatus::Subscribed))
        );
        assert_eq!(
            sub.events.recv().await,
            Some(FeedEvent::Status(ChannelStatus::Closed))
        );
    }

    #[tokio::test]
    async fn unavailable_feed_rejects_subscribe() {
        let (changes, _) = broadcast::channel(16);
        let feed = LocalChangeFeed::new(changes);
        feed.set_available(false);
        assert!(feed.subscribe("c1").await.is_err());
        feed.set_available(true);
        assert!(feed.subscribe("c1").await.is_ok());
    }
}
