pub mod im;

// 重新导出常用类型和函数，方便外部使用
pub use im::{
    client::{ChatClient, ClientConfig},
    login_with_password,
    message::{ChatMessage, MessageSyncListener, MessageSynchronizer},
    realtime::SubscriptionState,
};
