//! 聊天同步 CLI 客户端（测试版）
//!
//! 非交互式 CLI，用已有的 access token 连接后端，挂载会话列表，
//! 可选打开一个会话并发送一条消息，然后打印所有回调和同步事件

use anyhow::{Context, Result};
use chat_sync_core::im::chat_list::{ChatListListener, ChatSummary};
use chat_sync_core::im::error::GatewayError;
use chat_sync_core::im::thread::{MessageThreadListener, OutgoingMessage, ThreadMessage};
use chat_sync_core::{ChatClient, ClientConfig, ClientListeners};
use clap::Parser;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

/// 聊天同步 CLI 客户端
#[derive(Parser, Debug)]
#[command(name = "chat-sync-cli")]
#[command(about = "聊天同步 CLI 客户端 - 用于测试和展示同步功能", long_about = None)]
struct Args {
    /// 后端基础地址
    #[arg(long, env = "SUPABASE_URL")]
    api_url: String,

    /// 项目公开 key
    #[arg(long, env = "SUPABASE_ANON_KEY")]
    anon_key: String,

    /// 登录后拿到的 access token
    #[arg(long, env = "CHAT_ACCESS_TOKEN")]
    token: String,

    /// 当前用户 ID
    #[arg(long, env = "CHAT_USER_ID")]
    user_id: String,

    /// 本地缓存数据库
    #[arg(long, default_value = "sqlite://chat_cache.db?mode=rwc")]
    cache_db: String,

    /// 启动后打开的会话 ID
    #[arg(long)]
    chat: Option<String>,

    /// 打开会话后发送的文本（需要同时指定 --chat）
    #[arg(long, requires = "chat")]
    send: Option<String>,

    /// 不连接实时服务，只依赖定期同步
    #[arg(long)]
    no_realtime: bool,

    /// 运行时长（秒），0 表示持续运行
    #[arg(short, long, default_value = "0")]
    duration: u64,

    /// 日志级别（默认: info,chat_sync_core=debug）
    #[arg(long, default_value = "info,chat_sync_core=debug")]
    log_level: String,
}

/// 初始化日志（同时输出到 stdout 和文件）
fn init_logger(log_level: &str) {
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
        .expect("无法创建日志文件 debug.log");

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(true);

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
}

fn shorten(text: &str) -> String {
    if text.chars().count() > 30 {
        format!("{}…", text.chars().take(30).collect::<String>())
    } else {
        text.to_string()
    }
}

/// 输出所有接收到的回调
fn cli_listeners() -> ClientListeners {
    struct CliChatListListener;
    #[async_trait::async_trait]
    impl ChatListListener for CliChatListListener {
        async fn on_sync_started(&self, forced: bool) {
            info!("[CLI/ChatList] 🔄 同步开始: forced={}", forced);
        }

        async fn on_sync_finished(&self, count: usize) {
            info!("[CLI/ChatList] ✅ 同步完成: {} 个会话", count);
        }

        async fn on_sync_failed(&self, error: GatewayError) {
            error!("[CLI/ChatList] ❌ 同步失败: {}", error);
        }

        async fn on_chat_list_changed(&self, chats: Vec<ChatSummary>) {
            info!("[CLI/ChatList] 📋 会话列表（共 {} 个）:", chats.len());
            for chat in chats.iter().take(5) {
                let preview = chat
                    .last_message
                    .as_ref()
                    .map(|m| m.preview_text())
                    .unwrap_or_default();
                info!(
                    "[CLI]   - {} | {} | 未读: {} | 最新: {}",
                    chat.id,
                    chat.other_user.display_name,
                    chat.unread_count,
                    shorten(&preview)
                );
            }
        }

        async fn on_total_unread_count_changed(&self, total: u32) {
            info!("[CLI/ChatList] 📬 总未读数: {}", total);
        }
    }

    struct CliThreadListener;
    #[async_trait::async_trait]
    impl MessageThreadListener for CliThreadListener {
        async fn on_messages_changed(&self, chat_id: &str, messages: Vec<ThreadMessage>) {
            info!("[CLI/Thread] 💬 会话 {} 共 {} 条消息", chat_id, messages.len());
            if let Some(last) = messages.last() {
                info!(
                    "[CLI/Thread]   最新: [{:?}] {}: {}",
                    last.status,
                    last.sender_id,
                    shorten(&last.content)
                );
            }
        }

        async fn on_send_failed(&self, chat_id: &str, temp_id: &str, error: GatewayError) {
            error!(
                "[CLI/Thread] ❌ 会话 {} 消息 {} 发送失败: {}",
                chat_id, temp_id, error
            );
        }

        async fn on_sync_failed(&self, chat_id: &str, error: GatewayError) {
            error!("[CLI/Thread] ❌ 会话 {} 同步失败: {}", chat_id, error);
        }
    }

    ClientListeners {
        chat_list: Arc::new(CliChatListListener),
        thread: Arc::new(CliThreadListener),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logger(&args.log_level);

    info!("[CLI] 🚀 聊天同步 CLI 客户端（测试模式）");
    info!("[CLI] 👤 用户: {}", args.user_id);
    info!("[CLI] ⏱️  运行时长: {} 秒（0=持续运行）", args.duration);

    let mut config = ClientConfig::new(
        args.user_id.clone(),
        args.token.clone(),
        args.api_url.clone(),
        args.anon_key.clone(),
    );
    config.cache_db_url = args.cache_db.clone();
    config.realtime_enabled = !args.no_realtime;

    let client = ChatClient::connect(config, cli_listeners())
        .await
        .context("创建客户端失败")?;

    let mut events = client.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!("[CLI/Event] 📡 {:?}", event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("[CLI/Event] 跳过了 {} 个事件", skipped);
                }
                Err(_) => break,
            }
        }
    });

    client.start().await.context("启动同步失败")?;
    info!("[CLI] ✅ 同步已启动");

    if let Some(chat_id) = &args.chat {
        let thread = client.open_chat(chat_id).await?;
        thread.focus().await.ok();

        if let Some(text) = &args.send {
            let outgoing = OutgoingMessage::text(text.as_str())
                .map_err(|e| anyhow::anyhow!("消息无效: {}", e))?;
            let sent = thread.send(outgoing).await;
            info!("[CLI] 📤 消息 {} 状态: {:?}", sent.id, sent.status);
        }
    }

    info!("[CLI] 📥 开始监听变更...");
    if args.duration > 0 {
        info!("[CLI] ⏰ {} 秒后自动退出", args.duration);
        sleep(Duration::from_secs(args.duration)).await;
    } else {
        info!("[CLI] ⏰ 持续运行中，按 Ctrl+C 退出");
        tokio::signal::ctrl_c().await.context("等待 Ctrl+C 失败")?;
    }

    client.shutdown().await;
    info!("[CLI] 👋 程序退出");
    Ok(())
}
