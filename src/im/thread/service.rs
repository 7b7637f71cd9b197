//! 消息线程同步服务层
//!
//! 每个打开的会话一个实例：缓存秒开，拉取完整历史后整体替换；
//! 发送走乐观更新（临时 ID + sending），成功后原位替换为服务端行，失败标记为 failed 并保留。
//! 与会话列表一样，状态快照放在互斥锁里，锁不跨 await。

use crate::im::cache::{CacheKey, LocalCacheStore};
use crate::im::chat_list::ChatPreviewSink;
use crate::im::error::{GatewayError, GatewayResult};
use crate::im::events::{SyncEvent, SyncEventBus, SyncScope};
use crate::im::feed::{ChangeEvent, FeedOperation, FeedTable};
use crate::im::gateway::RemoteGateway;
use crate::im::serialization::{generate_client_key, is_temp_id};
use crate::im::thread::listener::MessageThreadListener;
use crate::im::thread::models::{
    dedupe_by_id, merge_incoming, MessageStatus, OutgoingMessage, ThreadMessage,
};
use crate::im::types::{MessageRow, ReadMarker, SyncPhase};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// 构造消息线程所需的协作者
#[derive(Clone)]
pub struct ThreadDeps {
    pub self_id: String,
    pub gateway: Arc<dyn RemoteGateway>,
    pub cache: LocalCacheStore,
    /// 会话列表预览的唯一写入口
    pub previews: Arc<dyn ChatPreviewSink>,
    pub bus: SyncEventBus,
    /// 发送成功后调用的服务端推送函数，`None` 表示不调用
    pub notify_function: Option<String>,
}

struct ThreadState {
    phase: SyncPhase,
    messages: Vec<ThreadMessage>,
    cache_loaded: bool,
    has_fetched: bool,
    focused: bool,
    /// 本进程内尚未返回结果的发送（临时 ID）
    in_flight: HashSet<String>,
    last_error: Option<GatewayError>,
}

/// 消息线程同步器
pub struct MessageThreadReconciler {
    chat_id: String,
    deps: ThreadDeps,
    listener: Arc<dyn MessageThreadListener>,
    state: Mutex<ThreadState>,
    live: AtomicBool,
}

impl MessageThreadReconciler {
    pub fn new(
        chat_id: impl Into<String>,
        deps: ThreadDeps,
        listener: Arc<dyn MessageThreadListener>,
    ) -> Self {
        Self {
            chat_id: chat_id.into(),
            deps,
            listener,
            state: Mutex::new(ThreadState {
                phase: SyncPhase::Uninitialized,
                messages: Vec::new(),
                cache_loaded: false,
                has_fetched: false,
                focused: false,
                in_flight: HashSet::new(),
                last_error: None,
            }),
            live: AtomicBool::new(true),
        }
    }

    fn state(&self) -> MutexGuard<'_, ThreadState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cache_key(&self) -> CacheKey {
        CacheKey::Messages(self.chat_id.clone())
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> SyncPhase {
        self.state().phase
    }

    pub fn messages(&self) -> Vec<ThreadMessage> {
        self.state().messages.clone()
    }

    pub fn last_error(&self) -> Option<GatewayError> {
        self.state().last_error.clone()
    }

    /// 挂载：先渲染缓存，再拉取完整历史
    pub async fn mount(&self) -> GatewayResult<Vec<ThreadMessage>> {
        info!("[Thread] 打开会话 {}", self.chat_id);
        self.live.store(true, Ordering::SeqCst);
        self.load_cached().await;
        self.fetch_history().await
    }

    pub fn unmount(&self) {
        info!("[Thread] 关闭会话 {}", self.chat_id);
        self.live.store(false, Ordering::SeqCst);
        self.state().focused = false;
    }

    pub async fn load_cached(&self) -> bool {
        let Some(cached) = self
            .deps
            .cache
            .load::<Vec<ThreadMessage>>(&self.cache_key())
            .await
        else {
            return false;
        };
        if !self.is_live() {
            return false;
        }

        let applied = {
            let mut state = self.state();
            if state.has_fetched {
                None
            } else {
                let mut cached = cached;
                fail_orphaned_sends(&mut cached, &state.in_flight);
                state.messages = cached.clone();
                state.cache_loaded = true;
                if state.phase == SyncPhase::Uninitialized {
                    state.phase = SyncPhase::CacheLoaded;
                }
                Some(cached)
            }
        };
        let Some(cached) = applied else {
            return false;
        };
        debug!("[Thread] 📦 会话 {} 从缓存加载 {} 条消息", self.chat_id, cached.len());
        self.listener.on_messages_changed(&self.chat_id, cached).await;
        true
    }

    /// 拉取完整历史（升序，过滤掉对自己隐藏的消息）并整体替换
    ///
    /// 本地尚未确认的乐观消息（sending / failed）如果不在结果里，保留在末尾；
    /// 其中没有对应进行中发送的 sending 条目改为 failed。
    pub async fn fetch_history(&self) -> GatewayResult<Vec<ThreadMessage>> {
        if self.is_live() {
            self.state().phase = SyncPhase::Fetching;
        }
        let result = self.deps.gateway.list_messages(&self.chat_id).await;
        if !self.is_live() {
            debug!("[Thread] 会话 {} 已关闭，丢弃历史拉取结果", self.chat_id);
            return result.map(|rows| rows.into_iter().map(ThreadMessage::from_row).collect());
        }

        let rows = match result {
            Ok(rows) => rows,
            Err(e) => {
                {
                    let mut state = self.state();
                    state.phase = SyncPhase::settled(state.has_fetched, state.cache_loaded);
                    state.last_error = Some(e.clone());
                }
                warn!("[Thread] ❌ 会话 {} 历史拉取失败: {}", self.chat_id, e);
                self.deps.bus.publish(SyncEvent::SyncFailed {
                    scope: SyncScope::Thread(self.chat_id.clone()),
                    kind: e.kind,
                });
                self.listener.on_sync_failed(&self.chat_id, e.clone()).await;
                return Err(e);
            }
        };

        let self_id = &self.deps.self_id;
        let fetched: Vec<ThreadMessage> = rows
            .into_iter()
            .filter(|row| !row.is_deleted_for(self_id))
            .map(ThreadMessage::from_row)
            .collect();

        let (messages, focused) = {
            let mut state = self.state();
            let mut next = fetched;
            let mut pending: Vec<ThreadMessage> = state
                .messages
                .iter()
                .filter(|m| m.status != MessageStatus::Sent)
                .filter(|m| {
                    !next
                        .iter()
                        .any(|f| f.client_key.is_some() && f.client_key == m.client_key)
                })
                .cloned()
                .collect();
            fail_orphaned_sends(&mut pending, &state.in_flight);
            next.extend(pending);
            let next = dedupe_by_id(next);

            state.messages = next.clone();
            state.has_fetched = true;
            state.phase = SyncPhase::Ready;
            state.last_error = None;
            (next, state.focused)
        };

        info!(
            "[Thread] ✅ 会话 {} 历史拉取完成，{} 条消息",
            self.chat_id,
            messages.len()
        );
        self.publish_changed(messages.clone()).await;
        if focused {
            self.mark_read_quietly().await;
        }
        Ok(messages)
    }

    /// 发送消息
    ///
    /// 立即追加一条 sending 的乐观消息；远端插入成功后按临时 ID 原位替换，
    /// 失败则标记为 failed（不移除、不自动重试）。返回该消息的最终状态。
    pub async fn send(&self, outgoing: OutgoingMessage) -> ThreadMessage {
        let client_key = generate_client_key();
        let optimistic =
            ThreadMessage::optimistic(&self.chat_id, &self.deps.self_id, &outgoing, &client_key);
        let temp_id = optimistic.id.clone();
        info!(
            "[Thread] 📤 发送消息: chat={}, temp_id={}, client_key={}",
            self.chat_id, temp_id, client_key
        );

        self.state().in_flight.insert(temp_id.clone());
        if self.is_live() {
            let snapshot = {
                let mut state = self.state();
                state.messages.push(optimistic.clone());
                state.messages.clone()
            };
            self.listener
                .on_messages_changed(&self.chat_id, snapshot)
                .await;
        }

        let request = outgoing.to_new_message(&self.chat_id, &self.deps.self_id, &client_key);
        match self.deps.gateway.insert_message(&request).await {
            Ok(row) => self.confirm_sent(&temp_id, row).await,
            Err(e) => self.mark_failed(optimistic, e).await,
        }
    }

    async fn confirm_sent(&self, temp_id: &str, row: MessageRow) -> ThreadMessage {
        let confirmed = ThreadMessage::from_row(row.clone());
        info!("[Thread] ✅ 消息已确认: {} -> {}", temp_id, row.id);
        self.state().in_flight.remove(temp_id);

        if self.is_live() {
            let (snapshot, focused) = {
                let mut state = self.state();
                let mut next = state.messages.clone();
                // 实时事件可能已经先把临时消息替换成服务端行
                if let Some(index) = next.iter().position(|m| m.id == temp_id) {
                    next[index] = confirmed.clone();
                } else if let Some(index) = next.iter().position(|m| m.id == row.id) {
                    next[index] = confirmed.clone();
                } else {
                    next.push(confirmed.clone());
                }
                state.messages = dedupe_by_id(next);
                (state.messages.clone(), state.focused)
            };
            self.publish_changed(snapshot).await;
            if focused {
                self.mark_read_quietly().await;
            }
        }

        self.deps
            .previews
            .update_chat_preview(&self.chat_id, &row)
            .await;
        self.notify_recipient(&row).await;
        confirmed
    }

    async fn mark_failed(&self, optimistic: ThreadMessage, error: GatewayError) -> ThreadMessage {
        warn!(
            "[Thread] ❌ 消息发送失败: chat={}, temp_id={}, 错误: {}",
            self.chat_id, optimistic.id, error
        );
        let mut failed = optimistic;
        failed.status = MessageStatus::Failed;
        self.state().in_flight.remove(&failed.id);

        if self.is_live() {
            let snapshot = {
                let mut state = self.state();
                if let Some(entry) = state.messages.iter_mut().find(|m| m.id == failed.id) {
                    entry.status = MessageStatus::Failed;
                }
                state.messages.clone()
            };
            self.deps.cache.save(&self.cache_key(), &snapshot);
            self.listener
                .on_messages_changed(&self.chat_id, snapshot)
                .await;
        }

        self.deps.bus.publish(SyncEvent::SyncFailed {
            scope: SyncScope::Thread(self.chat_id.clone()),
            kind: error.kind,
        });
        self.listener
            .on_send_failed(&self.chat_id, &failed.id, error)
            .await;
        failed
    }

    /// 用户手动重发一条 failed 消息：移除旧条目，用新的临时 ID 和幂等键重新发送
    pub async fn resend(&self, temp_id: &str) -> Option<ThreadMessage> {
        let failed = {
            let mut state = self.state();
            let index = state
                .messages
                .iter()
                .position(|m| m.id == temp_id && m.status == MessageStatus::Failed)?;
            state.messages.remove(index)
        };
        info!("[Thread] 🔁 重发消息 {}", temp_id);
        Some(self.send(OutgoingMessage::from_failed(&failed)).await)
    }

    /// 发送成功后通知服务端推送（失败只记日志）
    async fn notify_recipient(&self, row: &MessageRow) {
        let Some(function) = self.deps.notify_function.as_deref() else {
            return;
        };
        let body = serde_json::json!({
            "messageId": row.id,
            "chatId": row.chat_id,
        });
        if let Err(e) = self.deps.gateway.invoke_function(function, body).await {
            warn!("[Thread] 推送通知调用失败（忽略）: {}", e);
        }
    }

    /// 处理本会话的变更事件
    pub async fn on_feed_event(&self, event: ChangeEvent) {
        if event.table != FeedTable::Messages {
            return;
        }
        let row = match event.decode_row::<MessageRow>() {
            Ok(row) => row,
            Err(e) => {
                warn!("[Thread] 消息事件解析失败: {}", e);
                return;
            }
        };
        if row.chat_id != self.chat_id {
            return;
        }
        match event.operation {
            FeedOperation::Insert => self.on_message_inserted(row).await,
            FeedOperation::Update => self.on_message_updated(row).await,
        }
    }

    /// 新消息：与乐观消息去重后合并
    pub async fn on_message_inserted(&self, row: MessageRow) {
        if !self.is_live() || row.is_deleted_for(&self.deps.self_id) {
            return;
        }
        let (snapshot, focused) = {
            let mut state = self.state();
            state.messages = merge_incoming(&state.messages, &row);
            (state.messages.clone(), state.focused)
        };
        debug!("[Thread] 📥 会话 {} 合并消息 {}", self.chat_id, row.id);
        self.publish_changed(snapshot).await;
        if focused {
            self.mark_read_quietly().await;
        }
    }

    /// 消息更新：原位替换；变成对自己隐藏时移除
    pub async fn on_message_updated(&self, row: MessageRow) {
        if !self.is_live() {
            return;
        }
        let snapshot = {
            let mut state = self.state();
            let Some(index) = state.messages.iter().position(|m| m.id == row.id) else {
                return;
            };
            if row.is_deleted_for(&self.deps.self_id) {
                state.messages.remove(index);
            } else {
                state.messages[index] = ThreadMessage::from_row(row.clone());
            }
            state.messages.clone()
        };
        debug!("[Thread] 会话 {} 消息 {} 已更新", self.chat_id, row.id);
        self.publish_changed(snapshot).await;
    }

    /// 获得焦点：标记已读，之后列表有变化时持续标记
    pub async fn focus(&self) -> GatewayResult<()> {
        self.state().focused = true;
        self.mark_read().await
    }

    pub fn blur(&self) {
        self.state().focused = false;
    }

    /// upsert `(self, chat, now)`，同一冲突键，后写覆盖
    pub async fn mark_read(&self) -> GatewayResult<()> {
        let marker = ReadMarker {
            user_id: self.deps.self_id.clone(),
            chat_id: self.chat_id.clone(),
            last_read_at: Utc::now(),
        };
        self.deps.gateway.upsert_read_marker(&marker).await?;
        debug!("[Thread] 会话 {} 已读至 {}", self.chat_id, marker.last_read_at);
        Ok(())
    }

    async fn mark_read_quietly(&self) {
        if let Err(e) = self.mark_read().await {
            warn!("[Thread] 标记已读失败: {}", e);
        }
    }

    /// “仅对我删除”一条消息：远端把自己加入 `deleted_for`，再从本地列表移除
    ///
    /// 未确认的乐观消息只在本地移除。
    pub async fn delete_for_me(&self, message_id: &str) -> GatewayResult<()> {
        if !is_temp_id(message_id) {
            let state = self.deps.gateway.get_deleted_for(message_id).await?;
            if !state.deleted_for.iter().any(|id| id == &self.deps.self_id) {
                let mut deleted_for = state.deleted_for;
                deleted_for.push(self.deps.self_id.clone());
                self.deps
                    .gateway
                    .set_deleted_for(message_id, &deleted_for)
                    .await?;
            }
        }
        info!("[Thread] 🗑️ 仅对我删除消息 {}", message_id);

        if !self.is_live() {
            return Ok(());
        }
        let snapshot = {
            let mut state = self.state();
            state.messages.retain(|m| m.id != message_id);
            state.messages.clone()
        };
        self.publish_changed(snapshot).await;
        Ok(())
    }

    /// 持久化、回调并广播线程变更
    async fn publish_changed(&self, snapshot: Vec<ThreadMessage>) {
        self.deps.cache.save(&self.cache_key(), &snapshot);
        self.listener
            .on_messages_changed(&self.chat_id, snapshot)
            .await;
        self.deps.bus.publish(SyncEvent::ThreadChanged {
            chat_id: self.chat_id.clone(),
        });
    }
}

/// 把没有进行中发送的 sending 条目改为 failed（例如上次进程退出前未返回的发送），
/// 返回改动条数
fn fail_orphaned_sends(messages: &mut [ThreadMessage], in_flight: &HashSet<String>) -> usize {
    let mut changed = 0;
    for message in messages
        .iter_mut()
        .filter(|m| m.status == MessageStatus::Sending && !in_flight.contains(&m.id))
    {
        message.status = MessageStatus::Failed;
        changed += 1;
    }
    if changed > 0 {
        debug!("[Thread] {} 条未完成的发送标记为 failed", changed);
    }
    changed
}
