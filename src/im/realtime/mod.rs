//! 实时变更源模块
//!
//! 变更源接口、订阅状态机与重连策略，以及两种实现：
//! 托管实时服务（WebSocket）和进程内回环。

pub mod feed;
pub mod local;
pub mod phoenix;
pub mod reconnect;

pub use feed::{ChangeFeed, ChannelStatus, FeedEvent, FeedSubscription, SubscriptionId};
pub use local::LocalChangeFeed;
pub use phoenix::{RealtimeChangeFeed, RealtimeConfig};
pub use reconnect::{ReconnectPolicy, ReconnectStep, ReconnectTracker, SubscriptionState};
