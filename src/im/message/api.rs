//! 消息 HTTP API 客户端
//!
//! 通过托管数据库的 REST 接口读写 `messages` 表。

use crate::im::message::repository::MessageRepository;
use crate::im::message::types::{MessagePatch, MessageRow, NewMessage};
use crate::im::types::{ensure_rest_success, handle_rest_response};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use tracing::{debug, info};

pub struct RestMessageRepository {
    client: reqwest::Client,
    api_base_url: String,
}

impl RestMessageRepository {
    /// `client` 应该已经在外部配置好鉴权头（apikey + Bearer）
    pub fn new(client: reqwest::Client, api_base_url: String) -> Self {
        Self {
            client,
            api_base_url,
        }
    }

    fn table_url(&self, params: &[(&str, &str)]) -> Result<Url> {
        let base = format!(
            "{}/rest/v1/messages",
            self.api_base_url.trim_end_matches('/')
        );
        if params.is_empty() {
            return Url::parse(&base).context("构建消息 URL 失败");
        }
        Url::parse_with_params(&base, params).context("构建消息 URL 失败")
    }

    /// 按 ID 局部更新（只序列化有值的字段）
    fn update_request(&self, id: &str, patch: &MessagePatch) -> Result<reqwest::Request> {
        let filter = format!("eq.{}", id);
        let url = self.table_url(&[("id", filter.as_str())])?;
        self.client
            .patch(url)
            .header("Prefer", "return=minimal")
            .json(patch)
            .build()
            .context("构建更新消息请求失败")
    }
}

#[async_trait]
impl MessageRepository for RestMessageRepository {
    async fn fetch_messages(&self, conversation_id: &str) -> Result<Vec<MessageRow>> {
        let filter = format!("eq.{}", conversation_id);
        let url = self.table_url(&[
            ("select", "*"),
            ("conversation_id", filter.as_str()),
            ("order", "created_at.asc"),
        ])?;
        info!("[MsgAPI] 📡 拉取会话消息 conversationID={}", conversation_id);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("请求会话消息失败")?;
        let rows: Vec<MessageRow> = handle_rest_response(response, "拉取会话消息").await?;
        debug!("[MsgAPI] 拉取到 {} 条消息", rows.len());
        Ok(rows)
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<MessageRow> {
        let url = self.table_url(&[])?;
        debug!(
            "[MsgAPI] 📤 插入消息 conversationID={}, senderID={}",
            message.conversation_id, message.sender_id
        );

        let response = self
            .client
            .post(url)
            .header("Prefer", "return=representation")
            .json(message)
            .send()
            .await
            .context("插入消息请求失败")?;
        let mut rows: Vec<MessageRow> = handle_rest_response(response, "插入消息").await?;
        rows.pop()
            .ok_or_else(|| anyhow::anyhow!("插入消息成功但响应中没有返回行"))
    }

    async fn update_message(&self, id: &str, patch: &MessagePatch) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }
        let request = self.update_request(id, patch)?;
        debug!("[MsgAPI] ✏️ 更新消息 id={}", id);

        let response = self
            .client
            .execute(request)
            .await
            .context("更新消息请求失败")?;
        ensure_rest_success(response, "更新消息").await
    }

    async fn mark_read(&self, conversation_id: &str, reader_id: &str) -> Result<u64> {
        let conversation_filter = format!("eq.{}", conversation_id);
        let sender_filter = format!("neq.{}", reader_id);
        let url = self.table_url(&[
            ("conversation_id", conversation_filter.as_str()),
            ("sender_id", sender_filter.as_str()),
            ("is_read", "eq.false"),
            ("select", "id"),
        ])?;

        let response = self
            .client
            .patch(url)
            .header("Prefer", "return=representation")
            .json(&MessagePatch::read())
            .send()
            .await
            .context("标记已读请求失败")?;
        let updated: Vec<serde_json::Value> = handle_rest_response(response, "标记已读").await?;
        debug!(
            "[MsgAPI] 标记已读 conversationID={}, 条数={}",
            conversation_id,
            updated.len()
        );
        Ok(updated.len() as u64)
    }
}
