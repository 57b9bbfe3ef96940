//! 用户资料 HTTP 查询

use crate::im::profile::{Profile, ProfileLookup};
use crate::im::types::handle_rest_response;
use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

pub struct RestProfileLookup {
    client: reqwest::Client,
    api_base_url: String,
}

impl RestProfileLookup {
    /// `client` 应该已经在外部配置好鉴权头
    pub fn new(client: reqwest::Client, api_base_url: String) -> Self {
        Self {
            client,
            api_base_url,
        }
    }
}

#[async_trait]
impl ProfileLookup for RestProfileLookup {
    async fn fetch_profile(&self, user_id: &str) -> Result<Option<Profile>> {
        let id_filter = format!("eq.{}", user_id);
        let url = reqwest::Url::parse_with_params(
            &format!("{}/rest/v1/profiles", self.api_base_url.trim_end_matches('/')),
            &[
                ("select", "id,nickname,avatar_url"),
                ("id", id_filter.as_str()),
                ("limit", "1"),
            ],
        )
        .context("构建用户资料 URL 失败")?;
        debug!("[Profile] 📡 查询用户资料 userID={}", user_id);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("请求用户资料失败")?;

        let mut rows: Vec<Profile> = handle_rest_response(response, "查询用户资料").await?;
        Ok(rows.pop())
    }
}
