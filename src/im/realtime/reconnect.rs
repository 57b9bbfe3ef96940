//! 订阅状态与断线重连策略
//!
//! 连接断开后按指数退避重试：第 n 次重试前等待 `min(base * 2^(n-1), max_delay)`，
//! 连续失败达到上限后进入终态 `Failed`，只能通过重新打开会话恢复。

use std::time::Duration;

/// 会话订阅状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// 尚未打开
    Idle,
    Connecting,
    Subscribed,
    /// 第 `attempt` 次重连（从 1 开始）
    Reconnecting { attempt: u32 },
    /// 重连次数用尽（终态）
    Failed,
    Closed,
}

/// 重连退避策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// 第 `attempt` 次重连前的等待时间（`attempt` 从 1 开始）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let multiplier = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(multiplier).min(max_ms))
    }
}

/// 下一步动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectStep {
    Retry { attempt: u32, delay: Duration },
    GiveUp,
}

/// 重连计数器
#[derive(Debug, Clone)]
pub struct ReconnectTracker {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl ReconnectTracker {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// 当前已发起的连续重连次数
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// 订阅成功，计数清零
    pub fn on_subscribed(&mut self) {
        self.attempts = 0;
    }

    /// 连接断开或本次订阅失败
    pub fn on_failure(&mut self) -> ReconnectStep {
        if self.attempts >= self.policy.max_attempts {
            return ReconnectStep::GiveUp;
        }
        self.attempts += 1;
        ReconnectStep::Retry {
            attempt: self.attempts,
            delay: self.policy.delay_for(self.attempts),
        }
    }
}
