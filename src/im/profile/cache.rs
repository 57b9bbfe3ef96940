//! 用户资料 TTL 缓存
//!
//! 进程级状态，但不是全局单例：由调用方创建并持有，显式
//! `start_cleanup` / `shutdown`。过期条目在读取时视为不存在，
//! 清理任务定期回收内存。

use crate::im::message::models::SenderProfile;
use crate::im::profile::{Profile, ProfileLookup};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 默认缓存有效期
pub const DEFAULT_PROFILE_TTL: Duration = Duration::from_secs(300);

/// 默认清理间隔
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

struct CachedProfile {
    profile: Profile,
    expires_at: Instant,
}

pub struct ProfileCache {
    lookup: Arc<dyn ProfileLookup>,
    ttl: Duration,
    entries: Mutex<HashMap<String, CachedProfile>>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl ProfileCache {
    pub fn new(lookup: Arc<dyn ProfileLookup>, ttl: Duration) -> Self {
        Self {
            lookup,
            ttl,
            entries: Mutex::new(HashMap::new()),
            cleanup: Mutex::new(None),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CachedProfile>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 启动定期清理任务（重复调用会替换旧任务）
    pub fn start_cleanup(self: &Arc<Self>, every: Duration) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let purged = cache.purge_expired();
                if purged > 0 {
                    debug!("[Profile] 🧹 清理过期资料 {} 条", purged);
                }
            }
        });
        let previous = self
            .cleanup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        info!("[Profile] 启动资料缓存清理任务，间隔 {:?}", every);
    }

    /// 停止清理任务并清空缓存，可重复调用
    pub fn shutdown(&self) {
        let task = self
            .cleanup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
            info!("[Profile] 资料缓存已关闭");
        }
        self.entries().clear();
    }

    /// 只读缓存（不发起网络请求），未命中或已过期返回 `None`
    pub fn peek(&self, user_id: &str) -> Option<SenderProfile> {
        let now = Instant::now();
        self.entries()
            .get(user_id)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.profile.to_sender())
    }

    /// 写入缓存
    pub fn insert(&self, profile: Profile) {
        let expires_at = Instant::now() + self.ttl;
        self.entries()
            .insert(profile.id.clone(), CachedProfile { profile, expires_at });
    }

    /// 解析发送者展示信息：先查缓存，未命中再查询；失败降级为占位信息
    pub async fn resolve(&self, user_id: &str) -> SenderProfile {
        if let Some(sender) = self.peek(user_id) {
            return sender;
        }
        match self.lookup.fetch_profile(user_id).await {
            Ok(Some(profile)) => {
                let sender = profile.to_sender();
                self.insert(profile);
                sender
            }
            Ok(None) => {
                debug!("[Profile] 用户资料不存在 userID={}", user_id);
                SenderProfile::placeholder()
            }
            Err(e) => {
                warn!("[Profile] 查询用户资料失败 userID={}: {}", user_id, e);
                SenderProfile::placeholder()
            }
        }
    }

    pub fn invalidate(&self, user_id: &str) {
        self.entries().remove(user_id);
    }

    /// 删除过期条目，返回删除数量
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl Drop for ProfileCache {
    fn drop(&mut self) {
        if let Some(task) = self
            .cleanup
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}
