//! 消息模块
//!
//! 会话消息的存储、同步与本地有序列表维护

pub mod api;
pub mod dao;
pub mod listener;
pub mod models;
pub mod repository;
pub mod service;
pub mod timeline;
pub mod types;

// 重新导出主要类型和函数
pub use api::RestMessageRepository;
pub use dao::MessageStore;
pub use listener::{EmptyMessageSyncListener, MessageSyncListener};
pub use models::{ChatMessage, DeliveryState, SenderProfile, PLACEHOLDER_DISPLAY_NAME};
pub use repository::MessageRepository;
pub use service::{MessageSynchronizer, SyncBackends};
pub use timeline::{ConfirmOutcome, InsertOutcome, MessageTimeline, CONTENT_DEDUP_WINDOW_MS};
pub use types::{MessageChange, MessagePatch, MessageRow, NewMessage};
