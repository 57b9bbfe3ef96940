//! 聊天客户端
//!
//! 组装消息存储、实时变更源和用户资料缓存，为每个会话视图创建同步器。
//! 两种后端：托管服务（REST + WebSocket）和本地 SQLite（进程内回环）。

use crate::im::db::create_sqlite_pool_with_migration;
use crate::im::message::dao::MessageStore;
use crate::im::message::listener::MessageSyncListener;
use crate::im::message::repository::MessageRepository;
use crate::im::message::service::{MessageSynchronizer, SyncBackends};
use crate::im::message::RestMessageRepository;
use crate::im::profile::cache::{DEFAULT_CLEANUP_INTERVAL, DEFAULT_PROFILE_TTL};
use crate::im::profile::{ProfileCache, ProfileLookup, ProfileStore, RestProfileLookup};
use crate::im::realtime::{
    ChangeFeed, LocalChangeFeed, RealtimeChangeFeed, RealtimeConfig, ReconnectPolicy,
};
use crate::im::types::build_authed_client;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// 客户端配置
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// 当前登录用户 ID
    pub user_id: String,
    /// 鉴权 token（为空时使用 api_key）
    pub access_token: String,
    /// 项目公开 API key
    pub api_key: String,
    /// HTTP API 基础地址
    pub api_base_url: String,
    /// 实时服务 WebSocket 地址
    pub realtime_url: String,
    /// 用户资料缓存有效期
    pub profile_cache_ttl: Duration,
    /// 用户资料缓存清理间隔
    pub profile_cleanup_interval: Duration,
    /// 订阅断开后的重连策略
    pub reconnect: ReconnectPolicy,
    pub join_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl ClientConfig {
    /// 创建默认配置
    pub fn new(user_id: String, access_token: String, api_key: String) -> Self {
        Self {
            user_id,
            access_token,
            api_key,
            api_base_url: "http://localhost:54321".to_string(),
            realtime_url: "ws://localhost:54321".to_string(),
            profile_cache_ttl: DEFAULT_PROFILE_TTL,
            profile_cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            reconnect: ReconnectPolicy::default(),
            join_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(25),
        }
    }

    fn realtime_config(&self) -> RealtimeConfig {
        RealtimeConfig {
            join_timeout: self.join_timeout,
            heartbeat_interval: self.heartbeat_interval,
            ..RealtimeConfig::new(
                self.realtime_url.clone(),
                self.api_key.clone(),
                self.access_token.clone(),
            )
        }
    }
}

/// 本地模式下的存储句柄（用于写入演示数据或模拟断线）
#[derive(Clone)]
pub struct LocalBackends {
    pub messages: Arc<MessageStore>,
    pub profiles: Arc<ProfileStore>,
    pub feed: Arc<LocalChangeFeed>,
}

/// 聊天客户端
#[derive(Clone)]
pub struct ChatClient {
    config: ClientConfig,
    backends: SyncBackends,
    local: Option<LocalBackends>,
}

impl ChatClient {
    /// 使用托管服务创建客户端
    pub fn new(config: ClientConfig) -> Result<Self> {
        info!(
            "[Client] 🔗 使用托管服务 api={}, realtime={}",
            config.api_base_url, config.realtime_url
        );
        let http_client = build_authed_client(&config.api_key, &config.access_token)?;
        let repository = Arc::new(RestMessageRepository::new(
            http_client.clone(),
            config.api_base_url.clone(),
        ));
        let lookup = Arc::new(RestProfileLookup::new(
            http_client,
            config.api_base_url.clone(),
        ));
        let feed = Arc::new(RealtimeChangeFeed::new(config.realtime_config()));
        Ok(Self::with_backends(config, repository, feed, lookup))
    }

    /// 使用本地 SQLite 存储创建客户端，变更通过进程内回环推送
    ///
    /// 例如：`sqlite://market-chat.db?mode=rwc` 或 `sqlite::memory:`
    pub async fn new_local(config: ClientConfig, db_url: &str) -> Result<Self> {
        info!("[Client] 🔗 使用本地存储: {}", db_url);
        let pool = create_sqlite_pool_with_migration(db_url)
            .await
            .context(format!("连接SQLite数据库失败: {}", db_url))?;
        let messages = Arc::new(MessageStore::new(pool.clone()));
        let profiles = Arc::new(ProfileStore::new(pool));
        let feed = Arc::new(LocalChangeFeed::new(messages.change_sender()));

        let mut client =
            Self::with_backends(config, messages.clone(), feed.clone(), profiles.clone());
        client.local = Some(LocalBackends {
            messages,
            profiles,
            feed,
        });
        Ok(client)
    }

    /// 使用自定义后端创建客户端，并启动资料缓存清理任务
    pub fn with_backends(
        config: ClientConfig,
        repository: Arc<dyn MessageRepository>,
        feed: Arc<dyn ChangeFeed>,
        lookup: Arc<dyn ProfileLookup>,
    ) -> Self {
        let profiles = Arc::new(ProfileCache::new(lookup, config.profile_cache_ttl));
        profiles.start_cleanup(config.profile_cleanup_interval);
        Self {
            config,
            backends: SyncBackends {
                repository,
                feed,
                profiles,
            },
            local: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn profiles(&self) -> &Arc<ProfileCache> {
        &self.backends.profiles
    }

    /// 本地模式的存储句柄，托管模式下为 `None`
    pub fn local(&self) -> Option<&LocalBackends> {
        self.local.as_ref()
    }

    /// 为一个会话视图创建同步器
    pub fn synchronizer(&self, listener: Arc<dyn MessageSyncListener>) -> MessageSynchronizer {
        MessageSynchronizer::new(
            self.config.user_id.clone(),
            self.backends.clone(),
            listener,
            self.config.reconnect,
        )
    }

    /// 停止后台任务（资料缓存清理）
    pub fn shutdown(&self) {
        info!("[Client] 👋 关闭客户端");
        self.backends.profiles.shutdown();
    }
}
