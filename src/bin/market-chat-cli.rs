//! 市场聊天 CLI 客户端（测试版）
//!
//! 非交互式 CLI，用于测试和展示会话消息同步
//! 启动时通过命令行参数指定用户和会话，打开会话后发送指定消息，并展示收到的变更

use anyhow::{Context, Result};
use clap::Parser;
use market_chat_sdk_rust::im::client::{ChatClient, ClientConfig};
use market_chat_sdk_rust::im::message::types::NewMessage;
use market_chat_sdk_rust::im::message::{ChatMessage, MessageRepository, MessageSyncListener};
use market_chat_sdk_rust::im::realtime::SubscriptionState;
use market_chat_sdk_rust::login_with_password;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

/// 市场聊天 CLI 客户端
#[derive(Parser, Debug)]
#[command(name = "market-chat-cli")]
#[command(about = "市场聊天 CLI 客户端 - 用于测试和展示会话消息同步", long_about = None)]
struct Args {
    /// 登录邮箱（与 --password 一起使用）
    #[arg(long)]
    email: Option<String>,

    /// 登录密码
    #[arg(long)]
    password: Option<String>,

    /// 用户 ID（已有 token 或本地模式时使用）
    #[arg(long, default_value = "me")]
    user_id: String,

    /// 已有的 access token
    #[arg(long, default_value = "")]
    token: String,

    /// 项目公开 API key
    #[arg(long, default_value = "")]
    api_key: String,

    /// HTTP API 基础地址
    #[arg(long, default_value = "http://localhost:54321")]
    api_base_url: String,

    /// 实时服务地址
    #[arg(long, default_value = "ws://localhost:54321")]
    realtime_url: String,

    /// 会话 ID
    #[arg(short, long)]
    conversation: String,

    /// 打开会话后依次发送的消息（可重复）
    #[arg(short, long)]
    send: Vec<String>,

    /// 使用本地 SQLite 存储，例如 sqlite://market-chat.db?mode=rwc
    #[arg(long)]
    local_db: Option<String>,

    /// 本地模式下模拟对方回复的内容
    #[arg(long)]
    peer_reply: Option<String>,

    /// 本地模式下模拟一次断线
    #[arg(long)]
    simulate_drop: bool,

    /// 运行时长（秒），0 表示持续运行
    #[arg(short, long, default_value = "0")]
    duration: u64,

    /// 日志级别（默认: info,market_chat_sdk_rust=debug）
    #[arg(long, default_value = "info,market_chat_sdk_rust=debug")]
    log_level: String,
}

/// 初始化日志（同时输出到 stdout 和文件）
fn init_logger(log_level: &str) -> Result<()> {
    use std::fs::OpenOptions;
    use std::io;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // 优先使用环境变量 RUST_LOG（如果设置了），否则使用命令行参数
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open("debug.log")
        .context("无法创建日志文件 debug.log")?;

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(true);

    // 文件不需要颜色
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    info!("[CLI] 📝 日志已同时输出到控制台和文件: debug.log");
    Ok(())
}

/// 输出所有同步事件
struct CliSyncListener;

#[async_trait::async_trait]
impl MessageSyncListener for CliSyncListener {
    async fn on_messages_changed(&self, messages: Vec<ChatMessage>) {
        info!("[CLI/Message] 📋 消息列表（共 {} 条）", messages.len());
        if let Some(last) = messages.last() {
            let marker = if last.is_pending() { "⏳" } else { "✅" };
            info!(
                "[CLI/Message]   {} {} | {}: {}",
                marker, last.id, last.sender.display_name, last.content
            );
        }
    }

    async fn on_load_failed(&self, conversation_id: String, error: String) {
        error!(
            "[CLI/Message] ❌ 会话加载失败 conversationID={}: {}",
            conversation_id, error
        );
    }

    async fn on_send_failed(&self, placeholder_id: String, error: String) {
        error!(
            "[CLI/Message] ❌ 发送失败 placeholderID={}: {}",
            placeholder_id, error
        );
    }

    async fn on_sync_state_changed(&self, state: SubscriptionState) {
        match state {
            SubscriptionState::Failed => error!("[CLI/Sync] ⚠️ 重连失败，需要重新打开会话"),
            SubscriptionState::Reconnecting { attempt } => {
                warn!("[CLI/Sync] 🔄 正在重连（第 {} 次）", attempt)
            }
            other => info!("[CLI/Sync] 🔗 订阅状态: {:?}", other),
        }
    }
}

async fn build_client(args: &Args) -> Result<ChatClient> {
    if let Some(db_url) = &args.local_db {
        let config = ClientConfig::new(args.user_id.clone(), String::new(), String::new());
        return ChatClient::new_local(config, db_url).await;
    }

    let (user_id, access_token) = match (&args.email, &args.password) {
        (Some(email), Some(password)) => {
            let login =
                login_with_password(&args.api_base_url, &args.api_key, email, password)
                    .await
                    .context("登录失败")?;
            (login.user.id, login.access_token)
        }
        _ => (args.user_id.clone(), args.token.clone()),
    };
    info!("[CLI] ✅ 当前用户ID: {}", user_id);

    let mut config = ClientConfig::new(user_id, access_token, args.api_key.clone());
    config.api_base_url = args.api_base_url.clone();
    config.realtime_url = args.realtime_url.clone();
    ChatClient::new(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(&args.log_level)?;

    info!("[CLI] 🚀 市场聊天 CLI 客户端（测试模式）");
    info!("[CLI] 💬 会话: {}", args.conversation);
    info!("[CLI] ⏱️  运行时长: {} 秒（0=持续运行）", args.duration);

    let client = build_client(&args).await?;
    let user_id = client.config().user_id.clone();
    let sync = client.synchronizer(Arc::new(CliSyncListener));

    if let Err(e) = sync.open(&args.conversation).await {
        // 拉取失败不影响订阅，继续运行以接收新消息
        error!("[CLI] ❌ 打开会话失败: {:#}", e);
    }

    for text in &args.send {
        match sync.send(text, &user_id).await {
            Ok(message) => info!("[CLI] 📤 已发送 id={}", message.id),
            Err(e) => error!("[CLI] ❌ 发送失败: {:#}", e),
        }
    }

    if let Some(local) = client.local() {
        if let Some(reply) = &args.peer_reply {
            sleep(Duration::from_millis(500)).await;
            local
                .messages
                .insert_message(&NewMessage {
                    conversation_id: args.conversation.clone(),
                    sender_id: "peer".to_string(),
                    content: reply.clone(),
                    created_at: chrono::Utc::now(),
                })
                .await?;
            info!("[CLI] 🤖 已模拟对方回复");
        }
        if args.simulate_drop {
            sleep(Duration::from_millis(500)).await;
            info!("[CLI] 🔌 模拟断线");
            local.feed.disconnect_all();
        }
    }

    info!("[CLI] 📥 开始监听消息...");
    if args.duration > 0 {
        info!("[CLI] ⏰ {} 秒后自动退出", args.duration);
        sleep(Duration::from_secs(args.duration)).await;
    } else {
        info!("[CLI] ⏰ 持续运行中，按 Ctrl+C 退出");
        tokio::signal::ctrl_c().await.context("等待 Ctrl+C 失败")?;
    }

    sync.close().await;
    client.shutdown();
    info!("[CLI] 👋 程序退出");
    Ok(())
}
