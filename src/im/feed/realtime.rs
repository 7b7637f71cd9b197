//! 实时变更订阅（WebSocket）
//!
//! 使用托管实时服务的 Phoenix channel JSON 协议：
//! - 每个订阅单独一个 topic（`realtime:sub-<id>`），同一条变更不会重复投递给同一订阅
//! - 每 25 秒向 `phoenix` topic 发送心跳
//! - 连接断开后按 1s、2s、4s … 30s 退避重连，并重新加入所有仍有效的订阅

use crate::im::feed::hub::FeedHub;
use crate::im::feed::models::{
    ChangeEvent, ChangeFeed, FeedOperation, FeedSubscription, FeedTable, RowFilter,
    SubscriptionId,
};
use anyhow::Result;
use async_trait::async_trait;
use futures_util::{Sink, SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TOPIC_PREFIX: &str = "realtime:sub-";
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// 实时连接配置
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// 形如 `wss://<project>/realtime/v1/websocket`
    pub endpoint: String,
    pub api_key: String,
    pub access_token: String,
    pub heartbeat_interval: Duration,
}

impl RealtimeConfig {
    /// 由 HTTP 基础地址推导 WebSocket 地址
    pub fn new(api_base_url: &str, api_key: &str, access_token: &str) -> Self {
        let base = api_base_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        Self {
            endpoint: format!("{}/realtime/v1/websocket", ws_base),
            api_key: api_key.to_string(),
            access_token: access_token.to_string(),
            heartbeat_interval: Duration::from_secs(25),
        }
    }

    pub fn socket_url(&self) -> String {
        format!("{}?apikey={}&vsn=1.0.0", self.endpoint, self.api_key)
    }
}

/// 发给连接任务的指令
#[derive(Debug)]
enum ChannelCommand {
    Join {
        id: SubscriptionId,
        table: FeedTable,
        filter: Option<RowFilter>,
    },
    Leave {
        id: SubscriptionId,
    },
}

/// 收到的帧
#[derive(Debug, PartialEq)]
pub enum InboundFrame {
    Change {
        id: SubscriptionId,
        event: ChangeEvent,
    },
    /// 加入 channel 被拒绝或 channel 出错
    ChannelError { topic: String, reason: String },
    Ignored,
}

fn topic_for(id: SubscriptionId) -> String {
    format!("{}{}", TOPIC_PREFIX, id)
}

pub fn join_frame(
    id: SubscriptionId,
    table: FeedTable,
    filter: Option<&RowFilter>,
    access_token: &str,
    join_ref: u64,
) -> Value {
    let mut change = json!({
        "event": "*",
        "schema": "public",
        "table": table.as_str(),
    });
    if let Some(filter) = filter {
        change["filter"] = Value::String(filter.to_filter_string());
    }
    json!({
        "topic": topic_for(id),
        "event": "phx_join",
        "payload": {
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [change],
            },
            "access_token": access_token,
        },
        "ref": join_ref.to_string(),
    })
}

pub fn leave_frame(id: SubscriptionId, msg_ref: u64) -> Value {
    json!({
        "topic": topic_for(id),
        "event": "phx_leave",
        "payload": {},
        "ref": msg_ref.to_string(),
    })
}

pub fn heartbeat_frame(msg_ref: u64) -> Value {
    json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": msg_ref.to_string(),
    })
}

/// 解析一帧文本
pub fn decode_frame(text: &str) -> InboundFrame {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        return InboundFrame::Ignored;
    };
    let topic = frame.get("topic").and_then(Value::as_str).unwrap_or_default();
    let event = frame.get("event").and_then(Value::as_str).unwrap_or_default();

    match event {
        "postgres_changes" => {
            let Some(id) = topic
                .strip_prefix(TOPIC_PREFIX)
                .and_then(|raw| raw.parse::<SubscriptionId>().ok())
            else {
                return InboundFrame::Ignored;
            };
            let Some(data) = frame.pointer("/payload/data") else {
                return InboundFrame::Ignored;
            };
            let operation = match data.get("type").and_then(Value::as_str) {
                Some("INSERT") => FeedOperation::Insert,
                Some("UPDATE") => FeedOperation::Update,
                _ => return InboundFrame::Ignored,
            };
            let Some(table) = data
                .get("table")
                .and_then(Value::as_str)
                .and_then(FeedTable::from_name)
            else {
                return InboundFrame::Ignored;
            };
            let Some(row) = data.get("record").cloned() else {
                return InboundFrame::Ignored;
            };
            InboundFrame::Change {
                id,
                event: ChangeEvent {
                    table,
                    operation,
                    row,
                },
            }
        }
        "phx_reply" => {
            let status = frame
                .pointer("/payload/status")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if status == "error" {
                InboundFrame::ChannelError {
                    topic: topic.to_string(),
                    reason: frame
                        .pointer("/payload/response")
                        .map(Value::to_string)
                        .unwrap_or_default(),
                }
            } else {
                InboundFrame::Ignored
            }
        }
        "phx_error" | "system" if topic.starts_with(TOPIC_PREFIX) => {
            let status = frame
                .pointer("/payload/status")
                .and_then(Value::as_str)
                .unwrap_or("error");
            if event == "system" && status == "ok" {
                return InboundFrame::Ignored;
            }
            InboundFrame::ChannelError {
                topic: topic.to_string(),
                reason: frame.get("payload").map(Value::to_string).unwrap_or_default(),
            }
        }
        _ => InboundFrame::Ignored,
    }
}

/// 基于 WebSocket 的变更订阅
pub struct RealtimeFeed {
    hub: Arc<FeedHub>,
    commands: mpsc::UnboundedSender<ChannelCommand>,
    task: JoinHandle<()>,
}

impl RealtimeFeed {
    /// 启动后台连接任务后立即返回，连接在后台建立
    pub fn connect(config: RealtimeConfig) -> Self {
        let hub = Arc::new(FeedHub::new());
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_connection(config, hub.clone(), rx));
        Self {
            hub,
            commands,
            task,
        }
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for RealtimeFeed {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl ChangeFeed for RealtimeFeed {
    async fn subscribe(
        &self,
        table: FeedTable,
        filter: Option<RowFilter>,
    ) -> Result<FeedSubscription> {
        let subscription = self.hub.register(table, filter.clone());
        self.commands
            .send(ChannelCommand::Join {
                id: subscription.id,
                table,
                filter,
            })
            .map_err(|_| anyhow::anyhow!("实时连接任务已退出"))?;
        Ok(subscription)
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        if self.hub.remove(id) {
            let _ = self.commands.send(ChannelCommand::Leave { id });
        }
    }
}

enum SessionEnd {
    /// 连接断开，需要重连
    Dropped,
    /// 订阅端全部释放，任务退出
    Shutdown,
}

async fn run_connection(
    config: RealtimeConfig,
    hub: Arc<FeedHub>,
    mut commands: mpsc::UnboundedReceiver<ChannelCommand>,
) {
    let mut backoff = Duration::from_secs(1);
    loop {
        info!("[Realtime] 🔗 连接实时服务: {}", config.endpoint);
        match connect_async(config.socket_url()).await {
            Ok((ws, response)) => {
                info!("[Realtime] ✅ 连接成功, 状态: {}", response.status());
                backoff = Duration::from_secs(1);
                match run_session(&config, &hub, ws, &mut commands).await {
                    SessionEnd::Shutdown => {
                        info!("[Realtime] 👋 连接任务退出");
                        return;
                    }
                    SessionEnd::Dropped => warn!("[Realtime] ⚠️ 连接断开，准备重连"),
                }
            }
            Err(e) => error!("[Realtime] ❌ 连接失败: {}", e),
        }
        sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn send_frame<S>(write: &mut S, frame: Value) -> bool
where
    S: Sink<WsMessage> + Unpin,
{
    write.send(WsMessage::Text(frame.to_string())).await.is_ok()
}

async fn run_session(
    config: &RealtimeConfig,
    hub: &FeedHub,
    ws: WsStream,
    commands: &mut mpsc::UnboundedReceiver<ChannelCommand>,
) -> SessionEnd {
    let (mut write, mut read) = ws.split();
    let mut next_ref: u64 = 0;
    let mut joined: HashSet<SubscriptionId> = HashSet::new();

    for (id, table, filter) in hub.live_registrations() {
        next_ref += 1;
        let frame = join_frame(id, table, filter.as_ref(), &config.access_token, next_ref);
        if !send_frame(&mut write, frame).await {
            return SessionEnd::Dropped;
        }
        joined.insert(id);
    }
    if !joined.is_empty() {
        info!("[Realtime] 重新加入 {} 个订阅", joined.len());
    }

    let mut ticker = interval(config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                next_ref += 1;
                if !send_frame(&mut write, heartbeat_frame(next_ref)).await {
                    return SessionEnd::Dropped;
                }
            }
            cmd = commands.recv() => match cmd {
                None => {
                    let _ = write.close().await;
                    return SessionEnd::Shutdown;
                }
                Some(ChannelCommand::Join { id, table, filter }) => {
                    // 断线期间排队的指令：已重新加入或已退订的跳过
                    if joined.contains(&id) || !hub.is_live(id) {
                        continue;
                    }
                    next_ref += 1;
                    let frame = join_frame(id, table, filter.as_ref(), &config.access_token, next_ref);
                    if !send_frame(&mut write, frame).await {
                        return SessionEnd::Dropped;
                    }
                    joined.insert(id);
                    debug!("[Realtime] 加入 {}", topic_for(id));
                }
                Some(ChannelCommand::Leave { id }) => {
                    if joined.remove(&id) {
                        next_ref += 1;
                        if !send_frame(&mut write, leave_frame(id, next_ref)).await {
                            return SessionEnd::Dropped;
                        }
                        debug!("[Realtime] 离开 {}", topic_for(id));
                    }
                }
            },
            msg = read.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => match decode_frame(&text) {
                    InboundFrame::Change { id, event } => {
                        if !hub.deliver(id, event) {
                            debug!("[Realtime] 订阅 #{} 已失效，丢弃事件", id);
                        }
                    }
                    InboundFrame::ChannelError { topic, reason } => {
                        warn!("[Realtime] ⚠️ channel {} 出错: {}", topic, reason);
                    }
                    InboundFrame::Ignored => {}
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    warn!("[Realtime] 👋 连接关闭: {:?}", frame);
                    return SessionEnd::Dropped;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("[Realtime] WebSocket 错误: {}", e);
                    return SessionEnd::Dropped;
                }
                None => return SessionEnd::Dropped,
            },
        }
    }
}
