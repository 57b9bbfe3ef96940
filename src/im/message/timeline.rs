//! 会话消息时间线
//!
//! 单个会话的有序消息列表及其对账规则（乐观插入、确认替换、回滚、远端去重）。
//! 纯内存结构，不做 IO；由同步服务在锁内调用。

use crate::im::message::models::ChatMessage;
use crate::im::message::types::MessageRow;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// 内容去重的时间窗口（毫秒），两条消息创建时间差小于该值视为同一条
pub const CONTENT_DEDUP_WINDOW_MS: i64 = 5_000;

/// 远端插入事件的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// 追加到列表末尾
    Appended,
    /// ID 已存在，跳过
    DuplicateId,
    /// 内容 + 发送者 + 时间窗口匹配，跳过
    DuplicateContent,
    /// 会话已关闭或已切换，事件被丢弃
    Ignored,
}

/// 确认替换的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// 占位消息被替换为确认消息
    Replaced,
    /// 确认 ID 已经由变更源先行送达，丢弃占位消息
    AlreadyDelivered,
    /// 列表中找不到占位消息
    Missing,
}

#[derive(Debug, Default, Clone)]
pub struct MessageTimeline {
    messages: Vec<ChatMessage>,
}

impl MessageTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.messages.iter().any(|m| m.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// 载入初始全量数据
    ///
    /// 拉取期间已经由变更源送达的消息（ID 不在全量结果中）会被保留，
    /// 整体按创建时间稳定排序。
    pub fn load(&mut self, fetched: Vec<ChatMessage>) {
        let fetched_ids: HashSet<&str> = fetched.iter().map(|m| m.id.as_str()).collect();
        let carried: Vec<ChatMessage> = self
            .messages
            .iter()
            .filter(|m| !fetched_ids.contains(m.id.as_str()))
            .cloned()
            .collect();

        let mut merged = fetched;
        merged.extend(carried);
        merged.sort_by_key(|m| m.created_at);
        self.messages = merged;
    }

    /// 乐观插入待确认消息（始终追加到末尾）
    pub fn push_pending(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// 用确认消息替换占位消息，位置不变
    pub fn confirm(&mut self, placeholder_id: &str, confirmed: ChatMessage) -> ConfirmOutcome {
        let Some(index) = self.position(placeholder_id) else {
            return ConfirmOutcome::Missing;
        };
        if self.contains_id(&confirmed.id) {
            self.messages.remove(index);
            return ConfirmOutcome::AlreadyDelivered;
        }
        self.messages[index] = confirmed;
        ConfirmOutcome::Replaced
    }

    /// 回滚：删除占位消息
    pub fn rollback(&mut self, placeholder_id: &str) -> bool {
        match self.position(placeholder_id) {
            Some(index) => {
                self.messages.remove(index);
                true
            }
            None => false,
        }
    }

    /// 判断远端行是否与已有消息重复（按 ID、再按内容时间窗口），不修改列表
    pub fn find_duplicate(&self, row: &MessageRow) -> Option<InsertOutcome> {
        self.duplicate_of(&row.id, &row.sender_id, &row.content, row.created_at)
    }

    /// 应用远端插入事件（按 ID、再按内容时间窗口去重）
    pub fn apply_remote_insert(&mut self, message: ChatMessage) -> InsertOutcome {
        if let Some(duplicate) = self.duplicate_of(
            &message.id,
            &message.sender_id,
            &message.content,
            message.created_at,
        ) {
            return duplicate;
        }
        self.messages.push(message);
        InsertOutcome::Appended
    }

    fn duplicate_of(
        &self,
        id: &str,
        sender_id: &str,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> Option<InsertOutcome> {
        if self.contains_id(id) {
            return Some(InsertOutcome::DuplicateId);
        }
        let content_match = self.messages.iter().any(|m| {
            m.content == content
                && m.sender_id == sender_id
                && within_dedup_window(m.created_at, created_at)
        });
        content_match.then_some(InsertOutcome::DuplicateContent)
    }

    /// 合并远端更新（已读标记、内容），本地不存在时返回 false
    pub fn apply_remote_update(&mut self, row: &MessageRow) -> bool {
        match self.messages.iter_mut().find(|m| m.id == row.id) {
            Some(message) => {
                message.is_read = row.is_read;
                message.content = row.content.clone();
                true
            }
            None => false,
        }
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }
}

fn within_dedup_window(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    (a - b).num_milliseconds().abs() < CONTENT_DEDUP_WINDOW_MS
}
