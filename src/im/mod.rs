pub mod auth;
pub mod client;
pub mod db;
pub mod message;
pub mod profile;
pub mod realtime;
pub mod serialization;
pub mod types;

// 重新导出认证相关函数
pub use auth::login_with_password;

// 重新导出会话消息同步相关类型
pub use message::{
    ChatMessage, DeliveryState, EmptyMessageSyncListener, MessageSyncListener,
    MessageSynchronizer, SenderProfile,
};
pub use realtime::{ReconnectPolicy, SubscriptionState};
