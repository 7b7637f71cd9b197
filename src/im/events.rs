//! 跨组件同步事件总线
//!
//! 会话列表与消息线程之间的刷新信号通过枚举事件广播，
//! 订阅方持有 `Receiver`，drop 即退订。

use crate::im::error::GatewayErrorKind;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

/// 事件来源范围
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "scope", content = "chat_id", rename_all = "snake_case")]
pub enum SyncScope {
    ChatList,
    Thread(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    /// 会话列表完成一次全量拉取
    ChatListRefreshed { count: usize },
    /// 某个会话的最后一条消息预览被更新
    ChatPreviewUpdated { chat_id: String },
    /// 某个线程的消息列表发生变化
    ThreadChanged { chat_id: String },
    /// 远端调用失败（界面可展示可重试提示）
    SyncFailed {
        scope: SyncScope,
        kind: GatewayErrorKind,
    },
}

/// 类型化的发布 / 订阅总线
#[derive(Debug, Clone)]
pub struct SyncEventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl SyncEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// 发布事件；没有订阅者时直接丢弃
    pub fn publish(&self, event: SyncEvent) {
        debug!("[Bus] 发布事件: {:?}", event);
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for SyncEventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
