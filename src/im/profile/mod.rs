//! 用户资料模块
//!
//! 为消息附加发送者展示信息（昵称、头像）。查询失败时降级为占位信息，
//! 不阻塞消息展示。

pub mod api;
pub mod cache;
pub mod dao;

use crate::im::message::models::SenderProfile;
use crate::im::serialization::deserialize_null_default;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use api::RestProfileLookup;
pub use cache::ProfileCache;
pub use dao::ProfileStore;

/// 用户资料（`profiles` 表的一行）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub nickname: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl Profile {
    pub fn to_sender(&self) -> SenderProfile {
        if self.nickname.is_empty() {
            return SenderProfile {
                avatar_url: self.avatar_url.clone(),
                ..SenderProfile::placeholder()
            };
        }
        SenderProfile {
            display_name: self.nickname.clone(),
            avatar_url: self.avatar_url.clone(),
        }
    }
}

/// 资料查询接口（简单的 key → record 查询）
#[async_trait]
pub trait ProfileLookup: Send + Sync {
    async fn fetch_profile(&self, user_id: &str) -> Result<Option<Profile>>;
}
