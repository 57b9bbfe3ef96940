//! 会话消息同步服务
//!
//! 为单个会话维护本地有序消息列表，与远端变更源保持一致：
//! - 打开会话时拉取全量消息并建立订阅
//! - 发送消息时乐观插入，成功后替换为确认消息，失败则回滚
//! - 远端插入按 ID、再按内容时间窗口去重
//! - 订阅断开后按退避策略重连，次数用尽进入 `Failed`
//!
//! 同步器独占自己的订阅和消息列表。内部锁只在同步代码段中持有，
//! 监听器回调总是在释放锁之后按顺序调用。

use crate::im::message::listener::MessageSyncListener;
use crate::im::message::models::{ChatMessage, SenderProfile};
use crate::im::message::repository::MessageRepository;
use crate::im::message::timeline::{ConfirmOutcome, InsertOutcome, MessageTimeline};
use crate::im::message::types::{MessagePatch, MessageRow, NewMessage};
use crate::im::profile::ProfileCache;
use crate::im::realtime::{
    ChangeFeed, ChannelStatus, FeedEvent, FeedSubscription, ReconnectPolicy, ReconnectStep,
    ReconnectTracker, SubscriptionId, SubscriptionState,
};
use crate::im::serialization::{generate_placeholder_id, is_placeholder_id};
use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 同步器依赖的外部服务
#[derive(Clone)]
pub struct SyncBackends {
    pub repository: Arc<dyn MessageRepository>,
    pub feed: Arc<dyn ChangeFeed>,
    pub profiles: Arc<ProfileCache>,
}

struct SyncSession {
    /// 每次 open/close 递增；异步任务完成时据此判断会话是否仍然有效
    epoch: u64,
    conversation_id: Option<String>,
    timeline: MessageTimeline,
    state: SubscriptionState,
    reconnect_attempts: u32,
    supervisor: Option<JoinHandle<()>>,
    feed_subscription: Option<SubscriptionId>,
}

impl Default for SyncSession {
    fn default() -> Self {
        Self {
            epoch: 0,
            conversation_id: None,
            timeline: MessageTimeline::new(),
            state: SubscriptionState::Idle,
            reconnect_attempts: 0,
            supervisor: None,
            feed_subscription: None,
        }
    }
}

struct Inner {
    current_user_id: String,
    backends: SyncBackends,
    listener: Arc<dyn MessageSyncListener>,
    policy: ReconnectPolicy,
    session: Mutex<SyncSession>,
}

/// 会话消息同步器（可克隆句柄，克隆共享同一会话状态）
#[derive(Clone)]
pub struct MessageSynchronizer {
    inner: Arc<Inner>,
}

impl MessageSynchronizer {
    pub fn new(
        current_user_id: String,
        backends: SyncBackends,
        listener: Arc<dyn MessageSyncListener>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                current_user_id,
                backends,
                listener,
                policy,
                session: Mutex::new(SyncSession::default()),
            }),
        }
    }

    pub fn current_user_id(&self) -> &str {
        &self.inner.current_user_id
    }

    /// 当前打开的会话 ID
    pub fn conversation_id(&self) -> Option<String> {
        self.inner.session().conversation_id.clone()
    }

    /// 消息列表快照
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.inner.session().timeline.messages().to_vec()
    }

    pub fn state(&self) -> SubscriptionState {
        self.inner.session().state
    }

    /// 当前连续重连次数（订阅成功后归零）
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.session().reconnect_attempts
    }

    /// 打开会话：先拆除旧订阅，再建立新订阅并拉取全量消息
    ///
    /// 拉取失败时列表保持为空，错误通过监听器上报并返回；订阅不受影响。
    pub async fn open(&self, conversation_id: &str) -> Result<()> {
        self.teardown().await;

        let epoch = {
            let mut session = self.inner.session();
            session.epoch += 1;
            session.conversation_id = Some(conversation_id.to_string());
            session.timeline.clear();
            session.state = SubscriptionState::Connecting;
            session.reconnect_attempts = 0;
            session.epoch
        };
        info!(
            "[Sync] 📂 打开会话 conversationID={}, userID={}",
            conversation_id, self.inner.current_user_id
        );
        self.inner
            .listener
            .on_sync_state_changed(SubscriptionState::Connecting)
            .await;

        {
            let mut session = self.inner.session();
            if session.epoch != epoch {
                return Ok(());
            }
            session.supervisor = Some(tokio::spawn(run_supervisor(
                Arc::downgrade(&self.inner),
                self.inner.backends.feed.clone(),
                self.inner.policy,
                conversation_id.to_string(),
                epoch,
            )));
        }

        let rows = match self
            .inner
            .backends
            .repository
            .fetch_messages(conversation_id)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                error!(
                    "[Sync] ❌ 拉取会话消息失败 conversationID={}: {:#}",
                    conversation_id, e
                );
                if self.inner.is_current(epoch) {
                    self.inner
                        .listener
                        .on_load_failed(conversation_id.to_string(), format!("{:#}", e))
                        .await;
                }
                return Err(e.context("拉取会话消息失败"));
            }
        };

        let messages = self.inner.attach_profiles(rows).await;
        let snapshot = {
            let mut session = self.inner.session();
            if session.epoch != epoch {
                debug!("[Sync] 会话已切换，丢弃拉取结果");
                return Ok(());
            }
            session.timeline.load(messages);
            session.timeline.messages().to_vec()
        };
        info!("[Sync] ✅ 载入历史消息 {} 条", snapshot.len());
        self.inner.listener.on_messages_changed(snapshot).await;
        self.inner.spawn_mark_read(conversation_id.to_string());
        Ok(())
    }

    /// 发送消息
    ///
    /// 乐观插入在发出网络请求之前完成；失败时回滚并通过监听器上报。
    pub async fn send(&self, text: &str, sender_id: &str) -> Result<ChatMessage> {
        let content = text.trim();
        if content.is_empty() {
            anyhow::bail!("消息内容不能为空");
        }

        let sender = self
            .inner
            .backends
            .profiles
            .peek(sender_id)
            .unwrap_or_else(SenderProfile::placeholder);
        let placeholder_id = generate_placeholder_id();

        let (epoch, pending, snapshot) = {
            let mut session = self.inner.session();
            let Some(conversation_id) = session.conversation_id.clone() else {
                anyhow::bail!("会话未打开，无法发送消息");
            };
            let pending = ChatMessage::pending(
                placeholder_id.clone(),
                conversation_id,
                sender_id.to_string(),
                content.to_string(),
                Utc::now(),
                sender,
            );
            session.timeline.push_pending(pending.clone());
            (
                session.epoch,
                pending,
                session.timeline.messages().to_vec(),
            )
        };
        debug!("[Sync] 📝 乐观插入 placeholderID={}", placeholder_id);
        self.inner.listener.on_messages_changed(snapshot).await;

        let request = NewMessage {
            conversation_id: pending.conversation_id.clone(),
            sender_id: pending.sender_id.clone(),
            content: pending.content.clone(),
            created_at: pending.created_at,
        };

        match self.inner.backends.repository.insert_message(&request).await {
            Ok(row) => {
                let confirmed = ChatMessage::confirmed(row, pending.sender.clone());
                let snapshot = {
                    let mut session = self.inner.session();
                    if session.epoch != epoch {
                        None
                    } else {
                        let outcome = session.timeline.confirm(&placeholder_id, confirmed.clone());
                        if outcome == ConfirmOutcome::Missing {
                            warn!(
                                "[Sync] 找不到占位消息 placeholderID={}",
                                placeholder_id
                            );
                        }
                        Some(session.timeline.messages().to_vec())
                    }
                };
                match snapshot {
                    Some(snapshot) => {
                        info!(
                            "[Sync] ✅ 消息已确认 placeholderID={} -> id={}",
                            placeholder_id, confirmed.id
                        );
                        self.inner.listener.on_messages_changed(snapshot).await;
                    }
                    None => debug!("[Sync] 会话已关闭，忽略发送结果 id={}", confirmed.id),
                }
                Ok(confirmed)
            }
            Err(e) => {
                warn!(
                    "[Sync] ❌ 发送失败，回滚 placeholderID={}: {:#}",
                    placeholder_id, e
                );
                let snapshot = {
                    let mut session = self.inner.session();
                    if session.epoch == epoch && session.timeline.rollback(&placeholder_id) {
                        Some(session.timeline.messages().to_vec())
                    } else {
                        None
                    }
                };
                if let Some(snapshot) = snapshot {
                    self.inner.listener.on_messages_changed(snapshot).await;
                    self.inner
                        .listener
                        .on_send_failed(placeholder_id, format!("{:#}", e))
                        .await;
                }
                Err(e.context("发送消息失败"))
            }
        }
    }

    /// 修改一条已确认的消息（已读标记或内容）
    ///
    /// 本地列表不直接修改，等待变更源的更新事件合并。
    pub async fn update_message(&self, message_id: &str, patch: &MessagePatch) -> Result<()> {
        if is_placeholder_id(message_id) {
            anyhow::bail!("消息尚未确认，不能修改 id={}", message_id);
        }
        if patch.is_empty() {
            return Ok(());
        }
        self.inner
            .backends
            .repository
            .update_message(message_id, patch)
            .await
            .map_err(|e| e.context(format!("更新消息失败 id={}", message_id)))
    }

    /// 处理远端插入事件
    pub async fn on_remote_insert(&self, row: MessageRow) -> InsertOutcome {
        let epoch = self.inner.session().epoch;
        self.inner.apply_remote_insert(epoch, row).await
    }

    /// 处理远端更新事件，本地不存在时返回 false
    pub async fn on_remote_update(&self, row: MessageRow) -> bool {
        let epoch = self.inner.session().epoch;
        self.inner.apply_remote_update(epoch, row).await
    }

    /// 关闭会话：取消订阅和重连计时，清空列表。可重复调用
    pub async fn close(&self) {
        if !self.teardown().await {
            return;
        }
        self.inner.session().state = SubscriptionState::Closed;
        info!("[Sync] 👋 会话已关闭");
        self.inner
            .listener
            .on_sync_state_changed(SubscriptionState::Closed)
            .await;
    }

    /// 拆除当前会话，返回之前是否有打开的会话
    async fn teardown(&self) -> bool {
        let (was_open, supervisor, subscription) = {
            let mut session = self.inner.session();
            session.epoch += 1;
            session.timeline.clear();
            session.reconnect_attempts = 0;
            (
                session.conversation_id.take().is_some(),
                session.supervisor.take(),
                session.feed_subscription.take(),
            )
        };
        if let Some(task) = supervisor {
            task.abort();
        }
        if let Some(id) = subscription {
            self.inner.backends.feed.unsubscribe(id).await;
        }
        was_open
    }
}

impl Inner {
    fn session(&self) -> MutexGuard<'_, SyncSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.session().epoch == epoch
    }

    /// 更新订阅状态并通知监听器；会话已失效时返回 false
    async fn set_state(&self, epoch: u64, state: SubscriptionState, attempts: u32) -> bool {
        {
            let mut session = self.session();
            if session.epoch != epoch {
                return false;
            }
            session.state = state;
            session.reconnect_attempts = attempts;
        }
        self.listener.on_sync_state_changed(state).await;
        true
    }

    fn record_subscription(&self, epoch: u64, id: SubscriptionId) -> bool {
        let mut session = self.session();
        if session.epoch != epoch {
            return false;
        }
        session.feed_subscription = Some(id);
        true
    }

    fn clear_subscription(&self, epoch: u64, id: SubscriptionId) {
        let mut session = self.session();
        if session.epoch == epoch && session.feed_subscription == Some(id) {
            session.feed_subscription = None;
        }
    }

    async fn attach_profiles(&self, rows: Vec<MessageRow>) -> Vec<ChatMessage> {
        let mut senders: HashMap<String, SenderProfile> = HashMap::new();
        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let sender = match senders.get(&row.sender_id) {
                Some(sender) => sender.clone(),
                None => {
                    let sender = self.backends.profiles.resolve(&row.sender_id).await;
                    senders.insert(row.sender_id.clone(), sender.clone());
                    sender
                }
            };
            messages.push(ChatMessage::confirmed(row, sender));
        }
        messages
    }

    /// 会话失效或消息重复时返回对应结果，否则返回 `None`
    fn precheck_insert(&self, epoch: u64, row: &MessageRow) -> Option<InsertOutcome> {
        let session = self.session();
        if session.epoch != epoch
            || session.conversation_id.as_deref() != Some(row.conversation_id.as_str())
        {
            return Some(InsertOutcome::Ignored);
        }
        session.timeline.find_duplicate(row)
    }

    async fn apply_remote_insert(&self, epoch: u64, row: MessageRow) -> InsertOutcome {
        let from_other = row.sender_id != self.current_user_id;
        let conversation_id = row.conversation_id.clone();
        let message_id = row.id.clone();

        // 去重在资料查询之前完成，重复事件不触发查询
        let (outcome, snapshot) = match self.precheck_insert(epoch, &row) {
            Some(outcome) => (outcome, None),
            None => self.append_remote(epoch, row).await,
        };

        match outcome {
            InsertOutcome::Appended => {
                debug!("[Sync] 📥 新消息 id={}", message_id);
                if let Some(snapshot) = snapshot {
                    self.listener.on_messages_changed(snapshot).await;
                }
                if from_other {
                    self.spawn_mark_read(conversation_id);
                }
            }
            InsertOutcome::DuplicateId | InsertOutcome::DuplicateContent => {
                debug!("[Sync] 跳过重复消息 id={} ({:?})", message_id, outcome);
            }
            InsertOutcome::Ignored => {
                debug!("[Sync] 忽略非当前会话的消息 id={}", message_id);
            }
        }
        outcome
    }

    /// 解析发送者资料后追加；查询期间状态可能变化，锁内重新判定
    async fn append_remote(
        &self,
        epoch: u64,
        row: MessageRow,
    ) -> (InsertOutcome, Option<Vec<ChatMessage>>) {
        let sender = self.backends.profiles.resolve(&row.sender_id).await;
        let mut session = self.session();
        if session.epoch != epoch
            || session.conversation_id.as_deref() != Some(row.conversation_id.as_str())
        {
            return (InsertOutcome::Ignored, None);
        }
        let outcome = session
            .timeline
            .apply_remote_insert(ChatMessage::confirmed(row, sender));
        let snapshot = (outcome == InsertOutcome::Appended)
            .then(|| session.timeline.messages().to_vec());
        (outcome, snapshot)
    }

    async fn apply_remote_update(&self, epoch: u64, row: MessageRow) -> bool {
        let snapshot = {
            let mut session = self.session();
            if session.epoch != epoch || !session.timeline.apply_remote_update(&row) {
                None
            } else {
                Some(session.timeline.messages().to_vec())
            }
        };
        match snapshot {
            Some(snapshot) => {
                self.listener.on_messages_changed(snapshot).await;
                true
            }
            None => false,
        }
    }

    /// 标记已读（fire-and-forget，失败只记录日志）
    fn spawn_mark_read(&self, conversation_id: String) {
        let repository = self.backends.repository.clone();
        let reader_id = self.current_user_id.clone();
        tokio::spawn(async move {
            match repository.mark_read(&conversation_id, &reader_id).await {
                Ok(count) => debug!(
                    "[Sync] 标记已读 conversationID={}, 条数={}",
                    conversation_id, count
                ),
                Err(e) => warn!(
                    "[Sync] 标记已读失败 conversationID={}: {:#}",
                    conversation_id, e
                ),
            }
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let session = self
            .session
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = session.supervisor.take() {
            task.abort();
        }
        if let Some(id) = session.feed_subscription.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let feed = self.backends.feed.clone();
                handle.spawn(async move {
                    feed.unsubscribe(id).await;
                });
            }
        }
    }
}

/// 订阅结束原因
enum DriveEnd {
    /// 连接断开或订阅失败
    Dropped(ChannelStatus),
    /// 会话已关闭或切换
    Stale,
}

/// 订阅主循环：订阅 → 接收事件 → 断开后按策略重连
async fn run_supervisor(
    inner: Weak<Inner>,
    feed: Arc<dyn ChangeFeed>,
    policy: ReconnectPolicy,
    conversation_id: String,
    epoch: u64,
) {
    let mut tracker = ReconnectTracker::new(policy);
    loop {
        match feed.subscribe(&conversation_id).await {
            Ok(subscription) => {
                let id = subscription.id;
                let recorded = inner
                    .upgrade()
                    .map(|inner| inner.record_subscription(epoch, id))
                    .unwrap_or(false);
                if !recorded {
                    feed.unsubscribe(id).await;
                    return;
                }

                let end = drive_subscription(&inner, subscription, epoch, &mut tracker).await;
                feed.unsubscribe(id).await;
                if let Some(inner) = inner.upgrade() {
                    inner.clear_subscription(epoch, id);
                }
                match end {
                    DriveEnd::Stale => return,
                    DriveEnd::Dropped(status) => {
                        warn!(
                            "[Sync] 🔌 订阅断开 conversationID={}, status={:?}",
                            conversation_id, status
                        );
                    }
                }
            }
            Err(e) => {
                warn!(
                    "[Sync] 订阅失败 conversationID={}: {:#}",
                    conversation_id, e
                );
            }
        }

        let Some(strong) = inner.upgrade() else {
            return;
        };
        match tracker.on_failure() {
            ReconnectStep::Retry { attempt, delay } => {
                if !strong
                    .set_state(epoch, SubscriptionState::Reconnecting { attempt }, attempt)
                    .await
                {
                    return;
                }
                drop(strong);
                info!(
                    "[Sync] 🔄 {:?} 后进行第 {} 次重连 conversationID={}",
                    delay, attempt, conversation_id
                );
                tokio::time::sleep(delay).await;
            }
            ReconnectStep::GiveUp => {
                error!(
                    "[Sync] ❌ 重连 {} 次均失败，停止自动重连 conversationID={}",
                    tracker.attempts(),
                    conversation_id
                );
                strong
                    .set_state(epoch, SubscriptionState::Failed, tracker.attempts())
                    .await;
                return;
            }
        }
    }
}

/// 按送达顺序处理一次订阅的事件，直到断开或会话失效
async fn drive_subscription(
    inner: &Weak<Inner>,
    mut subscription: FeedSubscription,
    epoch: u64,
    tracker: &mut ReconnectTracker,
) -> DriveEnd {
    while let Some(event) = subscription.events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return DriveEnd::Stale;
        };
        if !inner.is_current(epoch) {
            return DriveEnd::Stale;
        }
        match event {
            FeedEvent::Status(ChannelStatus::Subscribed) => {
                tracker.on_subscribed();
                info!("[Sync] ✅ 订阅成功");
                if !inner
                    .set_state(epoch, SubscriptionState::Subscribed, 0)
                    .await
                {
                    return DriveEnd::Stale;
                }
            }
            FeedEvent::Status(status) => return DriveEnd::Dropped(status),
            FeedEvent::Insert(row) => {
                inner.apply_remote_insert(epoch, row).await;
            }
            FeedEvent::Update(row) => {
                inner.apply_remote_update(epoch, row).await;
            }
        }
    }
    DriveEnd::Dropped(ChannelStatus::Closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::message::models::DeliveryState;
    use crate::im::profile::{Profile, ProfileLookup};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::sync::Once;
    use std::time::Duration;
    use tokio::sync::{mpsc, Notify};

    static INIT_LOGGER: Once = Once::new();

    fn init_test_logger() {
        INIT_LOGGER.call_once(|| {
            use tracing_subscriber::prelude::*;
            use tracing_subscriber::EnvFilter;

            let filter_layer = EnvFilter::new("info,market_chat_sdk_rust=debug");
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(false)
                .with_test_writer();

            tracing_subscriber::registry()
                .with(filter_layer)
                .with(fmt_layer)
                .init();
        });
    }

    const ME: &str = "me";

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_714_552_200_000 + ms).unwrap()
    }

    fn row(id: &str, sender: &str, content: &str, created_at: DateTime<Utc>) -> MessageRow {
        MessageRow {
            id: id.to_string(),
            conversation_id: "c1".to_string(),
            sender_id: sender.to_string(),
            content: content.to_string(),
            is_read: false,
            created_at,
        }
    }

    #[derive(Default)]
    struct MockRepository {
        rows: Mutex<Vec<MessageRow>>,
        inserted: AtomicUsize,
        fail_fetch: AtomicBool,
        fail_insert: AtomicBool,
        insert_gate: Mutex<Option<Arc<Notify>>>,
        next_insert_id: Mutex<Option<String>>,
        mark_read_calls: AtomicUsize,
        updates: Mutex<Vec<(String, MessagePatch)>>,
    }

    impl MockRepository {
        fn seeded() -> Self {
            let repo = Self::default();
            repo.rows.lock().unwrap().extend([
                row("m2", ME, "second", at(2_000)),
                row("m1", "u2", "first", at(1_000)),
            ]);
            repo
        }

        fn gate(&self) -> Arc<Notify> {
            let gate = Arc::new(Notify::new());
            *self.insert_gate.lock().unwrap() = Some(gate.clone());
            gate
        }
    }

    #[async_trait]
    impl MessageRepository for MockRepository {
        async fn fetch_messages(&self, conversation_id: &str) -> Result<Vec<MessageRow>> {
            if self.fail_fetch.load(Ordering::SeqCst) {
                anyhow::bail!("fetch timed out");
            }
            let mut rows: Vec<MessageRow> = self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.conversation_id == conversation_id)
                .cloned()
                .collect();
            rows.sort_by_key(|r| r.created_at);
            Ok(rows)
        }

        async fn insert_message(&self, message: &NewMessage) -> Result<MessageRow> {
            let gate = self.insert_gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            if self.fail_insert.load(Ordering::SeqCst) {
                anyhow::bail!("insert rejected");
            }
            let n = self.inserted.fetch_add(1, Ordering::SeqCst);
            let id = self
                .next_insert_id
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| format!("srv-{}", n));
            let row = MessageRow {
                id,
                conversation_id: message.conversation_id.clone(),
                sender_id: message.sender_id.clone(),
                content: message.content.clone(),
                is_read: false,
                created_at: message.created_at,
            };
            self.rows.lock().unwrap().push(row.clone());
            Ok(row)
        }

        async fn update_message(&self, id: &str, patch: &MessagePatch) -> Result<()> {
            self.updates
                .lock()
                .unwrap()
                .push((id.to_string(), patch.clone()));
            Ok(())
        }

        async fn mark_read(&self, _conversation_id: &str, _reader_id: &str) -> Result<u64> {
            self.mark_read_calls.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        }
    }

    #[derive(Default)]
    struct MockFeed {
        fail_subscribe: AtomicBool,
        subscribe_calls: AtomicUsize,
        next_id: AtomicU64,
        senders: Mutex<HashMap<SubscriptionId, mpsc::Sender<FeedEvent>>>,
        unsubscribed: Mutex<Vec<SubscriptionId>>,
    }

    impl MockFeed {
        fn emit(&self, event: FeedEvent) {
            for sender in self.senders.lock().unwrap().values() {
                let _ = sender.try_send(event.clone());
            }
        }

        fn active(&self) -> usize {
            self.senders.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ChangeFeed for MockFeed {
        async fn subscribe(&self, _conversation_id: &str) -> Result<FeedSubscription> {
            self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_subscribe.load(Ordering::SeqCst) {
                anyhow::bail!("socket refused");
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            let (tx, events) = mpsc::channel(64);
            tx.try_send(FeedEvent::Status(ChannelStatus::Subscribed))
                .unwrap();
            self.senders.lock().unwrap().insert(id, tx);
            Ok(FeedSubscription { id, events })
        }

        async fn unsubscribe(&self, id: SubscriptionId) {
            self.senders.lock().unwrap().remove(&id);
            self.unsubscribed.lock().unwrap().push(id);
        }
    }

    #[derive(Default)]
    struct StaticLookup {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ProfileLookup for StaticLookup {
        async fn fetch_profile(&self, user_id: &str) -> Result<Option<Profile>> {
            self.calls.lock().unwrap().push(user_id.to_string());
            Ok(match user_id {
                "me" | "u2" => Some(Profile {
                    id: user_id.to_string(),
                    nickname: format!("nick-{}", user_id),
                    avatar_url: None,
                }),
                _ => None,
            })
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        states: Mutex<Vec<SubscriptionState>>,
        send_failures: Mutex<Vec<String>>,
        load_failures: Mutex<Vec<String>>,
        changes: AtomicUsize,
    }

    #[async_trait]
    impl MessageSyncListener for RecordingListener {
        async fn on_messages_changed(&self, _messages: Vec<ChatMessage>) {
            self.changes.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_load_failed(&self, _conversation_id: String, error: String) {
            self.load_failures.lock().unwrap().push(error);
        }
        async fn on_send_failed(&self, placeholder_id: String, _error: String) {
            self.send_failures.lock().unwrap().push(placeholder_id);
        }
        async fn on_sync_state_changed(&self, state: SubscriptionState) {
            self.states.lock().unwrap().push(state);
        }
    }

    struct Harness {
        repo: Arc<MockRepository>,
        feed: Arc<MockFeed>,
        listener: Arc<RecordingListener>,
        lookup: Arc<StaticLookup>,
        sync: MessageSynchronizer,
    }

    fn harness(repo: MockRepository) -> Harness {
        init_test_logger();
        let repo = Arc::new(repo);
        let feed = Arc::new(MockFeed::default());
        let listener = Arc::new(RecordingListener::default());
        let lookup = Arc::new(StaticLookup::default());
        let profiles = Arc::new(ProfileCache::new(
            lookup.clone(),
            Duration::from_secs(300),
        ));
        let sync = MessageSynchronizer::new(
            ME.to_string(),
            SyncBackends {
                repository: repo.clone(),
                feed: feed.clone(),
                profiles,
            },
            listener.clone(),
            ReconnectPolicy::default(),
        );
        Harness {
            repo,
            feed,
            listener,
            lookup,
            sync,
        }
    }

    fn lookups_for(h: &Harness, user_id: &str) -> usize {
        h.lookup
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|id| *id == user_id)
            .count()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..2_000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("condition not reached in time");
    }

    fn ids(sync: &MessageSynchronizer) -> Vec<String> {
        sync.messages().into_iter().map(|m| m.id).collect()
    }

    #[tokio::test]
    async fn open_loads_history_in_order_and_marks_read() {
        let h = harness(MockRepository::seeded());
        h.sync.open("c1").await.unwrap();

        assert_eq!(ids(&h.sync), vec!["m1", "m2"]);
        let messages = h.sync.messages();
        assert_eq!(messages[0].sender.display_name, "nick-u2");
        assert!(messages
            .iter()
            .all(|m| m.delivery == DeliveryState::Confirmed));

        wait_until(|| h.sync.state() == SubscriptionState::Subscribed).await;
        wait_until(|| h.repo.mark_read_calls.load(Ordering::SeqCst) == 1).await;
        assert_eq!(h.sync.conversation_id().as_deref(), Some("c1"));
    }

    #[tokio::test(start_paused = true)]
    async fn send_confirm_then_reconnect_scenario() {
        let h = harness(MockRepository::seeded());
        h.sync.open("c1").await.unwrap();
        wait_until(|| h.sync.state() == SubscriptionState::Subscribed).await;
        assert_eq!(h.sync.messages().len(), 2);

        let gate = h.repo.gate();
        *h.repo.next_insert_id.lock().unwrap() = Some("m9".to_string());
        let sync = h.sync.clone();
        let send = tokio::spawn(async move { sync.send("hi", ME).await });

        wait_until(|| h.sync.messages().len() == 3).await;
        let last = h.sync.messages().pop().unwrap();
        assert!(last.is_pending());
        assert!(is_placeholder_id(&last.id));
        assert_eq!(last.content, "hi");
        assert_eq!(last.sender.display_name, "nick-me");

        gate.notify_one();
        let confirmed = send.await.unwrap().unwrap();
        assert_eq!(confirmed.id, "m9");
        assert_eq!(ids(&h.sync), vec!["m1", "m2", "m9"]);
        assert_eq!(
            h.sync.messages()[2].delivery,
            DeliveryState::Confirmed
        );

        let dropped_at = tokio::time::Instant::now();
        h.feed.emit(FeedEvent::Status(ChannelStatus::Closed));
        wait_until(|| h.sync.state() == SubscriptionState::Reconnecting { attempt: 1 }).await;
        assert_eq!(h.sync.reconnect_attempts(), 1);

        wait_until(|| h.sync.state() == SubscriptionState::Subscribed).await;
        assert!(dropped_at.elapsed() >= Duration::from_millis(1_000));
        assert_eq!(h.sync.reconnect_attempts(), 0);
        assert_eq!(h.sync.messages().len(), 3);
        assert_eq!(h.feed.subscribe_calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.feed.active(), 1);
    }

    #[tokio::test]
    async fn failed_send_rolls_back_and_reports() {
        let h = harness(MockRepository::seeded());
        h.sync.open("c1").await.unwrap();
        let before = h.sync.messages();

        h.repo.fail_insert.store(true, Ordering::SeqCst);
        let result = h.sync.send("hi", ME).await;

        assert!(result.is_err());
        assert_eq!(h.sync.messages(), before);
        let failures = h.listener.send_failures.lock().unwrap().clone();
        assert_eq!(failures.len(), 1);
        assert!(is_placeholder_id(&failures[0]));
    }

    #[tokio::test]
    async fn blank_text_is_rejected_without_touching_list() {
        let h = harness(MockRepository::seeded());
        h.sync.open("c1").await.unwrap();
        let changes = h.listener.changes.load(Ordering::SeqCst);

        assert!(h.sync.send("   \n", ME).await.is_err());
        assert_eq!(h.sync.messages().len(), 2);
        assert_eq!(h.listener.changes.load(Ordering::SeqCst), changes);
        assert_eq!(h.repo.inserted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn send_without_open_conversation_fails() {
        let h = harness(MockRepository::default());
        assert!(h.sync.send("hi", ME).await.is_err());
        assert!(h.sync.messages().is_empty());
    }

    #[tokio::test]
    async fn successful_sends_stay_ordered_and_confirmed() {
        let h = harness(MockRepository::seeded());
        h.sync.open("c1").await.unwrap();

        for text in ["one", "two", "three", "four"] {
            h.sync.send(text, ME).await.unwrap();
        }
        let messages = h.sync.messages();
        assert_eq!(messages.len(), 6);
        assert!(messages
            .windows(2)
            .all(|pair| pair[0].created_at <= pair[1].created_at));
        assert!(messages.iter().all(|m| !m.is_pending()));
        let contents: Vec<_> = messages[2..].iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two", "three", "four"]);
    }

    #[tokio::test]
    async fn duplicate_remote_insert_yields_single_entry() {
        let h = harness(MockRepository::seeded());
        h.sync.open("c1").await.unwrap();

        let incoming = row("m3", "u2", "anyone there?", at(3_000));
        assert_eq!(
            h.sync.on_remote_insert(incoming.clone()).await,
            InsertOutcome::Appended
        );
        assert_eq!(
            h.sync.on_remote_insert(incoming.clone()).await,
            InsertOutcome::DuplicateId
        );

        wait_until(|| h.sync.state() == SubscriptionState::Subscribed).await;
        h.feed.emit(FeedEvent::Insert(incoming));
        let late = row("m4", "u2", "hello?", at(9_000));
        h.feed.emit(FeedEvent::Insert(late));
        wait_until(|| h.sync.messages().len() == 4).await;

        let m3_count = h.sync.messages().iter().filter(|m| m.id == "m3").count();
        assert_eq!(m3_count, 1);
        assert_eq!(ids(&h.sync), vec!["m1", "m2", "m3", "m4"]);
        // open 一次 + 两条他人新消息各一次
        wait_until(|| h.repo.mark_read_calls.load(Ordering::SeqCst) == 3).await;
    }

    #[tokio::test]
    async fn duplicates_are_dropped_before_profile_lookup() {
        let h = harness(MockRepository::seeded());
        h.sync.open("c1").await.unwrap();

        // 未知用户的资料不会被缓存，每次追加都会查询
        let first = row("m5", "stranger", "price?", at(5_000));
        assert_eq!(
            h.sync.on_remote_insert(first.clone()).await,
            InsertOutcome::Appended
        );
        assert_eq!(lookups_for(&h, "stranger"), 1);

        assert_eq!(
            h.sync.on_remote_insert(first).await,
            InsertOutcome::DuplicateId
        );
        let resent = row("m6", "stranger", "price?", at(6_000));
        assert_eq!(
            h.sync.on_remote_insert(resent).await,
            InsertOutcome::DuplicateContent
        );
        let mut elsewhere = row("m7", "stranger", "wrong room", at(7_000));
        elsewhere.conversation_id = "c2".to_string();
        assert_eq!(
            h.sync.on_remote_insert(elsewhere).await,
            InsertOutcome::Ignored
        );

        assert_eq!(lookups_for(&h, "stranger"), 1);
        assert_eq!(h.sync.messages().len(), 3);
        assert_eq!(h.sync.messages()[2].sender.display_name, "Unknown");
    }

    #[tokio::test]
    async fn echo_of_pending_message_is_not_duplicated() {
        let h = harness(MockRepository::seeded());
        h.sync.open("c1").await.unwrap();

        let gate = h.repo.gate();
        *h.repo.next_insert_id.lock().unwrap() = Some("m9".to_string());
        let sync = h.sync.clone();
        let send = tokio::spawn(async move { sync.send("hi", ME).await });
        wait_until(|| h.sync.messages().len() == 3).await;
        let pending = h.sync.messages().pop().unwrap();

        let echo = row("m9", ME, "hi", pending.created_at);
        assert_eq!(
            h.sync.on_remote_insert(echo).await,
            InsertOutcome::DuplicateContent
        );

        gate.notify_one();
        send.await.unwrap().unwrap();
        assert_eq!(ids(&h.sync), vec!["m1", "m2", "m9"]);
        assert_eq!(h.repo.mark_read_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn update_message_goes_through_repository() {
        let h = harness(MockRepository::seeded());
        h.sync.open("c1").await.unwrap();

        let edit = MessagePatch {
            is_read: None,
            content: Some("second (edited)".to_string()),
        };
        h.sync.update_message("m2", &edit).await.unwrap();
        assert!(h.sync.update_message("temp-123", &edit).await.is_err());
        h.sync
            .update_message(
                "m1",
                &MessagePatch {
                    is_read: None,
                    content: None,
                },
            )
            .await
            .unwrap();

        let updates = h.repo.updates.lock().unwrap().clone();
        assert_eq!(updates, vec![("m2".to_string(), edit)]);
        // 本地内容等待更新事件
        assert_eq!(h.sync.messages()[1].content, "second");
    }

    #[tokio::test]
    async fn remote_update_merges_read_flag() {
        let h = harness(MockRepository::seeded());
        h.sync.open("c1").await.unwrap();
        wait_until(|| h.sync.state() == SubscriptionState::Subscribed).await;

        let mut update = row("m2", ME, "second", at(2_000));
        update.is_read = true;
        h.feed.emit(FeedEvent::Update(update));
        wait_until(|| h.sync.messages()[1].is_read).await;

        assert!(!h.sync.on_remote_update(row("zzz", "u2", "x", at(0))).await);
        assert_eq!(h.sync.messages().len(), 2);
    }

    #[tokio::test]
    async fn fetch_failure_leaves_list_empty_and_reports() {
        let repo = MockRepository::seeded();
        repo.fail_fetch.store(true, Ordering::SeqCst);
        let h = harness(repo);

        assert!(h.sync.open("c1").await.is_err());
        assert!(h.sync.messages().is_empty());
        assert_eq!(h.listener.load_failures.lock().unwrap().len(), 1);
        // 订阅照常建立
        wait_until(|| h.sync.state() == SubscriptionState::Subscribed).await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_gives_up_after_five_failed_attempts() {
        let h = harness(MockRepository::seeded());
        h.feed.fail_subscribe.store(true, Ordering::SeqCst);
        let started = tokio::time::Instant::now();

        h.sync.open("c1").await.unwrap();
        wait_until(|| h.sync.state() == SubscriptionState::Failed).await;

        // 首次订阅 + 5 次重连
        assert_eq!(h.feed.subscribe_calls.load(Ordering::SeqCst), 6);
        assert!(started.elapsed() >= Duration::from_millis(1_000 + 2_000 + 4_000 + 8_000 + 16_000));

        let states = h.listener.states.lock().unwrap().clone();
        assert_eq!(
            states,
            vec![
                SubscriptionState::Connecting,
                SubscriptionState::Reconnecting { attempt: 1 },
                SubscriptionState::Reconnecting { attempt: 2 },
                SubscriptionState::Reconnecting { attempt: 3 },
                SubscriptionState::Reconnecting { attempt: 4 },
                SubscriptionState::Reconnecting { attempt: 5 },
                SubscriptionState::Failed,
            ]
        );

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.feed.subscribe_calls.load(Ordering::SeqCst), 6);

        // 手动重新打开后恢复
        h.feed.fail_subscribe.store(false, Ordering::SeqCst);
        h.sync.close().await;
        h.sync.open("c1").await.unwrap();
        wait_until(|| h.sync.state() == SubscriptionState::Subscribed).await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_pending_reconnect_timer() {
        let h = harness(MockRepository::seeded());
        h.sync.open("c1").await.unwrap();
        wait_until(|| h.sync.state() == SubscriptionState::Subscribed).await;

        h.feed.fail_subscribe.store(true, Ordering::SeqCst);
        h.feed.emit(FeedEvent::Status(ChannelStatus::TimedOut));
        wait_until(|| h.sync.state() == SubscriptionState::Reconnecting { attempt: 1 }).await;

        h.sync.close().await;
        let calls = h.feed.subscribe_calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.feed.subscribe_calls.load(Ordering::SeqCst), calls);
        assert_eq!(h.sync.state(), SubscriptionState::Closed);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_ignores_late_send_completion() {
        let h = harness(MockRepository::seeded());
        h.sync.open("c1").await.unwrap();
        wait_until(|| h.sync.state() == SubscriptionState::Subscribed).await;

        let gate = h.repo.gate();
        let sync = h.sync.clone();
        let send = tokio::spawn(async move { sync.send("bye", ME).await });
        wait_until(|| h.sync.messages().len() == 3).await;

        h.sync.close().await;
        h.sync.close().await;
        assert_eq!(h.sync.state(), SubscriptionState::Closed);
        assert_eq!(h.feed.active(), 0);
        assert_eq!(h.feed.unsubscribed.lock().unwrap().len(), 1);
        assert!(h.sync.messages().is_empty());

        gate.notify_one();
        assert!(send.await.unwrap().is_ok());
        assert!(h.sync.messages().is_empty());
        assert_eq!(
            h.listener
                .states
                .lock()
                .unwrap()
                .iter()
                .filter(|s| **s == SubscriptionState::Closed)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn reopen_tears_down_previous_subscription() {
        let h = harness(MockRepository::seeded());
        h.sync.open("c1").await.unwrap();
        wait_until(|| h.sync.state() == SubscriptionState::Subscribed).await;

        h.sync.open("c2").await.unwrap();
        assert!(h.sync.messages().is_empty());
        wait_until(|| h.sync.state() == SubscriptionState::Subscribed).await;

        assert_eq!(h.feed.active(), 1);
        assert_eq!(*h.feed.unsubscribed.lock().unwrap(), vec![1]);

        // 旧会话的事件不会进入新列表
        let stray = row("m7", "u2", "old conversation", at(0));
        assert_eq!(h.sync.on_remote_insert(stray).await, InsertOutcome::Ignored);
    }
}
