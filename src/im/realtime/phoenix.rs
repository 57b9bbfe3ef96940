//! 托管实时服务的 WebSocket 变更源
//!
//! 服务端使用 Phoenix channel 协议：连接后对 `realtime:messages:<会话ID>` 发送
//! `phx_join`，携带 `postgres_changes` 过滤条件；之后以 `postgres_changes`
//! 事件推送行级 INSERT/UPDATE。每个订阅独占一条连接。

use crate::im::message::types::MessageRow;
use crate::im::realtime::feed::{
    ChangeFeed, ChannelStatus, FeedEvent, FeedSubscription, SubscriptionId, FEED_CHANNEL_CAPACITY,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};

/// WebSocket 写入端类型别名
pub type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// WebSocket 读取端类型别名
pub type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// 实时服务配置
#[derive(Clone, Debug)]
pub struct RealtimeConfig {
    /// WebSocket 服务地址，例如 `wss://xyz.example.co`
    pub realtime_url: String,
    pub api_key: String,
    pub access_token: String,
    pub schema: String,
    pub table: String,
    /// 建立连接和等待 `phx_join` 应答的超时时间；连接超时返回错误，应答超时上报 `TimedOut`
    pub join_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl RealtimeConfig {
    pub fn new(realtime_url: String, api_key: String, access_token: String) -> Self {
        Self {
            realtime_url,
            api_key,
            access_token,
            schema: "public".to_string(),
            table: "messages".to_string(),
            join_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(25),
        }
    }

    /// 构建 WebSocket 连接 URL
    pub fn socket_url(&self) -> Result<Url> {
        let base = format!(
            "{}/realtime/v1/websocket",
            self.realtime_url.trim_end_matches('/')
        );
        Url::parse_with_params(&base, &[("apikey", self.api_key.as_str()), ("vsn", "1.0.0")])
            .context("构建实时服务 URL 失败")
    }
}

/// Phoenix 协议帧
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhoenixFrame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

pub fn topic_for(conversation_id: &str) -> String {
    format!("realtime:messages:{}", conversation_id)
}

/// 构造 `phx_join` 帧（订阅该会话的 INSERT 与 UPDATE）
pub fn join_frame(config: &RealtimeConfig, conversation_id: &str, join_ref: &str) -> PhoenixFrame {
    let filter = format!("conversation_id=eq.{}", conversation_id);
    let changes: Vec<Value> = ["INSERT", "UPDATE"]
        .iter()
        .map(|event| {
            json!({
                "event": event,
                "schema": config.schema,
                "table": config.table,
                "filter": filter,
            })
        })
        .collect();

    PhoenixFrame {
        topic: topic_for(conversation_id),
        event: "phx_join".to_string(),
        payload: json!({
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": changes,
            },
            "access_token": config.access_token,
        }),
        reference: Some(join_ref.to_string()),
    }
}

fn leave_frame(topic: &str, leave_ref: String) -> PhoenixFrame {
    PhoenixFrame {
        topic: topic.to_string(),
        event: "phx_leave".to_string(),
        payload: json!({}),
        reference: Some(leave_ref),
    }
}

fn heartbeat_frame(seq: u64) -> PhoenixFrame {
    PhoenixFrame {
        topic: "phoenix".to_string(),
        event: "heartbeat".to_string(),
        payload: json!({}),
        reference: Some(format!("hb-{}", seq)),
    }
}

/// 解析服务端文本帧，返回需要上报的事件（心跳应答等返回 `None`）
pub fn parse_frame(text: &str, join_ref: &str) -> Result<Option<FeedEvent>> {
    let frame: PhoenixFrame = serde_json::from_str(text).context("解析 Phoenix 帧失败")?;
    let status = frame.payload.get("status").and_then(|v| v.as_str());

    let event = match frame.event.as_str() {
        "phx_reply" => {
            if frame.reference.as_deref() != Some(join_ref) {
                return Ok(None);
            }
            if status == Some("ok") {
                Some(FeedEvent::Status(ChannelStatus::Subscribed))
            } else {
                Some(FeedEvent::Status(ChannelStatus::ChannelError))
            }
        }
        "postgres_changes" => {
            let Some(data) = frame.payload.get("data") else {
                return Ok(None);
            };
            let kind = data.get("type").and_then(|v| v.as_str()).unwrap_or_default();
            let record = data.get("record").cloned().unwrap_or(Value::Null);
            match kind {
                "INSERT" | "UPDATE" => {
                    let row: MessageRow =
                        serde_json::from_value(record).context("解析变更记录失败")?;
                    if kind == "INSERT" {
                        Some(FeedEvent::Insert(row))
                    } else {
                        Some(FeedEvent::Update(row))
                    }
                }
                _ => None,
            }
        }
        "phx_close" => Some(FeedEvent::Status(ChannelStatus::Closed)),
        "phx_error" => Some(FeedEvent::Status(ChannelStatus::ChannelError)),
        "system" if status == Some("error") => {
            Some(FeedEvent::Status(ChannelStatus::ChannelError))
        }
        _ => None,
    };
    Ok(event)
}

async fn send_frame(writer: &Arc<Mutex<WsWriter>>, frame: &PhoenixFrame) -> Result<()> {
    let text = serde_json::to_string(frame)?;
    let mut w = writer.lock().await;
    w.send(WsMessage::Text(text)).await?;
    Ok(())
}

struct ActiveChannel {
    topic: String,
    writer: Arc<Mutex<WsWriter>>,
    tasks: Vec<JoinHandle<()>>,
}

/// WebSocket 变更源
pub struct RealtimeChangeFeed {
    config: RealtimeConfig,
    next_id: AtomicU64,
    channels: std::sync::Mutex<HashMap<SubscriptionId, ActiveChannel>>,
}

impl RealtimeChangeFeed {
    pub fn new(config: RealtimeConfig) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(1),
            channels: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// 当前活跃订阅数
    pub fn active_count(&self) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl ChangeFeed for RealtimeChangeFeed {
    async fn subscribe(&self, conversation_id: &str) -> Result<FeedSubscription> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let url = self.config.socket_url()?;
        let join_ref = format!("join-{}", id);
        let join = join_frame(&self.config, conversation_id, &join_ref);
        let join_timeout = self.config.join_timeout;

        info!(
            "[Realtime] 🔗 连接实时服务 (conversation={}, subscription={})",
            conversation_id, id
        );
        // 握手和 phx_join 共用超时，超时按订阅失败处理
        let connect = async {
            let (ws_stream, response) = connect_async(url.as_str())
                .await
                .context("连接实时服务失败")?;
            debug!("[Realtime] WebSocket 握手完成, 状态: {}", response.status());

            let (write, read) = ws_stream.split();
            let writer = Arc::new(Mutex::new(write));
            send_frame(&writer, &join)
                .await
                .context("发送 phx_join 失败")?;
            Ok::<_, anyhow::Error>((writer, read))
        };
        let (writer, read) = tokio::time::timeout(join_timeout, connect)
            .await
            .map_err(|_| {
                warn!(
                    "[Realtime] ⏰ 连接实时服务超时 ({:?}) subscription={}",
                    join_timeout, id
                );
                anyhow::anyhow!("连接实时服务超时 ({:?})", join_timeout)
            })??;
        debug!("[Realtime] 📤 已发送 phx_join: topic={}", join.topic);

        let (tx, events) = mpsc::channel(FEED_CHANNEL_CAPACITY);
        let joined = Arc::new(AtomicBool::new(false));

        let reader_task = tokio::spawn(read_loop(read, tx.clone(), join_ref, joined.clone()));

        let writer_for_heartbeat = writer.clone();
        let heartbeat_every = self.config.heartbeat_interval;
        let heartbeat_task = tokio::spawn(async move {
            let mut ticker = interval(heartbeat_every);
            // 第一次 tick 立即返回
            ticker.tick().await;
            let mut seq = 0u64;
            loop {
                ticker.tick().await;
                seq += 1;
                if send_frame(&writer_for_heartbeat, &heartbeat_frame(seq))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let timeout_task = tokio::spawn(async move {
            tokio::time::sleep(join_timeout).await;
            if !joined.load(Ordering::SeqCst) {
                warn!(
                    "[Realtime] ⏰ 订阅超时 ({:?}) subscription={}",
                    join_timeout, id
                );
                let _ = tx.send(FeedEvent::Status(ChannelStatus::TimedOut)).await;
            }
        });

        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                ActiveChannel {
                    topic: join.topic,
                    writer,
                    tasks: vec![reader_task, heartbeat_task, timeout_task],
                },
            );

        Ok(FeedSubscription { id, events })
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        let channel = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        let Some(channel) = channel else {
            return;
        };

        for task in &channel.tasks {
            task.abort();
        }
        let leave = leave_frame(&channel.topic, format!("leave-{}", id));
        if let Err(e) = send_frame(&channel.writer, &leave).await {
            debug!("[Realtime] 发送 phx_leave 失败（连接可能已断开）: {}", e);
        }
        let mut w = channel.writer.lock().await;
        if let Err(e) = w.close().await {
            debug!("[Realtime] 关闭 WebSocket 失败: {}", e);
        }
        info!("[Realtime] 👋 已取消订阅 subscription={}", id);
    }
}

/// 读取循环：把服务端帧翻译为 `FeedEvent`
async fn read_loop(
    mut read: WsReader,
    tx: mpsc::Sender<FeedEvent>,
    join_ref: String,
    joined: Arc<AtomicBool>,
) {
    let terminal = loop {
        let Some(msg_result) = read.next().await else {
            break ChannelStatus::Closed;
        };
        match msg_result {
            Ok(WsMessage::Text(text)) => match parse_frame(&text, &join_ref) {
                Ok(Some(event)) => {
                    if event == FeedEvent::Status(ChannelStatus::Subscribed) {
                        joined.store(true, Ordering::SeqCst);
                        info!("[Realtime] ✅ 订阅成功");
                    }
                    let stop = matches!(event, FeedEvent::Status(status) if status.is_terminal());
                    if tx.send(event).await.is_err() {
                        return;
                    }
                    if stop {
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("[Realtime] 忽略无法解析的帧: {}, 原始数据: {}", e, text);
                }
            },
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {}
            Ok(WsMessage::Close(frame)) => {
                warn!("[Realtime] 👋 连接关闭: {:?}", frame);
                break ChannelStatus::Closed;
            }
            Err(e) => {
                error!("[Realtime] WebSocket 错误: {}", e);
                break ChannelStatus::ChannelError;
            }
            _ => {}
        }
    };
    let _ = tx.send(FeedEvent::Status(terminal)).await;
}
