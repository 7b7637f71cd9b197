//! 会话列表同步服务层
//!
//! 合并本地缓存、全量拉取和实时事件，维护一个有序、去重、带未读数的会话摘要列表。
//!
//! 状态机：`Uninitialized -> CacheLoaded -> Fetching -> Ready`，强制刷新时 `Ready -> Fetching`。
//! 列表快照放在互斥锁里，每个处理函数在一个临界区内完成“读快照 - 计算 - 写回”，
//! 锁不跨 await；卸载后（`live == false`）迟到的结果直接丢弃。

use crate::im::cache::{CacheKey, LocalCacheStore};
use crate::im::chat_list::listener::{ChatListListener, ChatPreviewSink};
use crate::im::chat_list::models::{
    apply_message_insert, apply_preview, clear_unread, filter_chats, sort_by_activity,
    total_unread, ChatSummary, LastMessage, OpenChatTracker, OtherUser,
};
use crate::im::error::{GatewayError, GatewayResult};
use crate::im::events::{SyncEvent, SyncEventBus, SyncScope};
use crate::im::feed::{ChangeEvent, FeedOperation, FeedTable};
use crate::im::gateway::{ProfileDirectory, RemoteGateway};
use crate::im::serialization::epoch;
use crate::im::types::{ChatRow, MessageRow, SyncPhase, UserProfile};
use async_trait::async_trait;
use futures_util::future::try_join_all;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 取最后一条可见消息时查看的最近消息条数
///
/// 最近这么多条全部“仅对我删除”的会话不会出现在列表里，即使更早的消息仍可见。
pub const RECENT_WINDOW: usize = 10;

/// 构造会话列表所需的协作者
#[derive(Clone)]
pub struct ChatListDeps {
    pub self_id: String,
    pub gateway: Arc<dyn RemoteGateway>,
    pub cache: LocalCacheStore,
    pub bus: SyncEventBus,
    pub open_chat: OpenChatTracker,
    /// 资料更新触发强制刷新的最小间隔
    pub profile_refresh_throttle: Duration,
}

struct ChatListState {
    phase: SyncPhase,
    chats: Vec<ChatSummary>,
    cache_loaded: bool,
    has_fetched: bool,
    /// 已应用的最新一次全量拉取序号，更早发起的拉取结果不再覆盖
    applied_fetch: u64,
    last_error: Option<GatewayError>,
    search_query: String,
    last_profile_refresh: Option<Instant>,
    trailing_refresh_scheduled: bool,
}

enum RefreshDecision {
    Now,
    Trailing(Duration),
    Coalesced,
}

/// 会话列表同步器
pub struct ChatListReconciler {
    self_id: String,
    gateway: Arc<dyn RemoteGateway>,
    profiles: ProfileDirectory,
    cache: LocalCacheStore,
    bus: SyncEventBus,
    open_chat: OpenChatTracker,
    throttle: Duration,
    listener: Arc<dyn ChatListListener>,
    state: Mutex<ChatListState>,
    fetch_seq: AtomicU64,
    live: AtomicBool,
}

impl ChatListReconciler {
    pub fn new(deps: ChatListDeps, listener: Arc<dyn ChatListListener>) -> Self {
        let profiles = ProfileDirectory::new(deps.gateway.clone(), deps.cache.clone());
        Self {
            self_id: deps.self_id,
            gateway: deps.gateway,
            profiles,
            cache: deps.cache,
            bus: deps.bus,
            open_chat: deps.open_chat,
            throttle: deps.profile_refresh_throttle,
            listener,
            state: Mutex::new(ChatListState {
                phase: SyncPhase::Uninitialized,
                chats: Vec::new(),
                cache_loaded: false,
                has_fetched: false,
                applied_fetch: 0,
                last_error: None,
                search_query: String::new(),
                last_profile_refresh: None,
                trailing_refresh_scheduled: false,
            }),
            fetch_seq: AtomicU64::new(0),
            live: AtomicBool::new(true),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChatListState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> SyncPhase {
        self.state().phase
    }

    pub fn chats(&self) -> Vec<ChatSummary> {
        self.state().chats.clone()
    }

    pub fn last_error(&self) -> Option<GatewayError> {
        self.state().last_error.clone()
    }

    pub fn total_unread(&self) -> u32 {
        total_unread(&self.state().chats)
    }

    /// 挂载：先渲染缓存，再总是做一次全量拉取
    pub async fn mount(&self) -> GatewayResult<Vec<ChatSummary>> {
        info!("[ChatList] 挂载会话列表，用户: {}", self.self_id);
        self.live.store(true, Ordering::SeqCst);
        self.load_cached().await;
        self.full_fetch(false).await
    }

    /// 卸载后所有迟到的结果都被丢弃
    pub fn unmount(&self) {
        info!("[ChatList] 卸载会话列表");
        self.live.store(false, Ordering::SeqCst);
    }

    /// 读取缓存快照，返回是否命中
    pub async fn load_cached(&self) -> bool {
        let Some(cached) = self
            .cache
            .load::<Vec<ChatSummary>>(&CacheKey::ChatList)
            .await
        else {
            debug!("[ChatList] 无缓存快照");
            return false;
        };
        if !self.is_live() {
            return false;
        }

        let applied = {
            let mut state = self.state();
            // 已经拉取过远端数据时，缓存只会更旧
            if state.has_fetched {
                false
            } else {
                state.chats = cached.clone();
                state.cache_loaded = true;
                if state.phase == SyncPhase::Uninitialized {
                    state.phase = SyncPhase::CacheLoaded;
                }
                true
            }
        };
        if applied {
            info!("[ChatList] 📦 从缓存加载 {} 个会话", cached.len());
            self.notify_changed(cached).await;
        }
        applied
    }

    /// 全量拉取并整体替换列表
    ///
    /// `force` 时绕过用户资料缓存（并回填）。失败时保留现有数据，状态回到拉取前的稳定状态。
    pub async fn full_fetch(&self, force: bool) -> GatewayResult<Vec<ChatSummary>> {
        let seq = self.fetch_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.state().phase = SyncPhase::Fetching;
        info!("[ChatList] 🔄 全量拉取 #{} (force={})", seq, force);
        self.listener.on_sync_started(force).await;

        let result = self.fetch_summaries(force).await;
        if !self.is_live() {
            debug!("[ChatList] 已卸载，丢弃拉取 #{} 的结果", seq);
            return result;
        }

        match result {
            Ok(chats) => {
                let applied = {
                    let mut state = self.state();
                    if seq < state.applied_fetch {
                        false
                    } else {
                        state.applied_fetch = seq;
                        state.chats = chats.clone();
                        state.has_fetched = true;
                        state.phase = SyncPhase::Ready;
                        state.last_error = None;
                        true
                    }
                };
                if !applied {
                    debug!("[ChatList] 拉取 #{} 已过期，跳过", seq);
                    return Ok(chats);
                }

                info!("[ChatList] ✅ 拉取 #{} 完成，{} 个会话", seq, chats.len());
                self.cache.save(&CacheKey::ChatList, &chats);
                self.notify_changed(chats.clone()).await;
                self.bus
                    .publish(SyncEvent::ChatListRefreshed { count: chats.len() });
                self.listener.on_sync_finished(chats.len()).await;
                Ok(chats)
            }
            Err(e) => {
                {
                    let mut state = self.state();
                    state.phase = SyncPhase::settled(state.has_fetched, state.cache_loaded);
                    state.last_error = Some(e.clone());
                }
                warn!("[ChatList] ❌ 拉取 #{} 失败: {}", seq, e);
                self.bus.publish(SyncEvent::SyncFailed {
                    scope: SyncScope::ChatList,
                    kind: e.kind,
                });
                self.listener.on_sync_failed(e.clone()).await;
                Err(e)
            }
        }
    }

    /// 手动重试（拉取失败后由界面触发）
    pub async fn retry(&self) -> GatewayResult<Vec<ChatSummary>> {
        self.full_fetch(false).await
    }

    async fn fetch_summaries(&self, force: bool) -> GatewayResult<Vec<ChatSummary>> {
        let rows = self.gateway.list_chats_for(&self.self_id).await?;
        debug!("[ChatList] 远端共有 {} 个会话", rows.len());

        let resolved = try_join_all(rows.iter().map(|chat| self.build_summary(chat, force))).await?;
        let mut chats: Vec<ChatSummary> = resolved.into_iter().flatten().collect();
        sort_by_activity(&mut chats);
        Ok(chats)
    }

    async fn build_summary(&self, chat: &ChatRow, force: bool) -> GatewayResult<Option<ChatSummary>> {
        let other_id = chat.other_participant(&self.self_id);
        let profile: UserProfile = self.profiles.resolve(other_id, force).await?;

        let recent = self
            .gateway
            .recent_messages(&chat.id, RECENT_WINDOW)
            .await?;
        let Some(last) = recent.iter().find(|m| !m.is_deleted_for(&self.self_id)) else {
            debug!(
                "[ChatList] 会话 {} 最近 {} 条消息均不可见，不展示",
                chat.id, RECENT_WINDOW
            );
            return Ok(None);
        };

        let unread_count = if self.open_chat.is_open(&chat.id) {
            0
        } else {
            let since = self
                .gateway
                .get_read_marker(&self.self_id, &chat.id)
                .await?
                .map(|marker| marker.last_read_at)
                .unwrap_or_else(epoch);
            self.gateway
                .count_unread(&chat.id, &self.self_id, since)
                .await?
        };

        Ok(Some(ChatSummary {
            id: chat.id.clone(),
            created_at: chat.created_at,
            other_user: OtherUser::from_profile(&profile),
            last_message: Some(LastMessage::from_row(last)),
            unread_count,
        }))
    }

    /// 处理一条变更事件（messages 插入 / users 更新）
    pub async fn handle_feed_event(self: &Arc<Self>, event: ChangeEvent) {
        match (event.table, event.operation) {
            (FeedTable::Messages, FeedOperation::Insert) => match event.decode_row::<MessageRow>() {
                Ok(row) => self.on_message_inserted(row).await,
                Err(e) => warn!("[ChatList] 消息事件解析失败: {}", e),
            },
            (FeedTable::Users, FeedOperation::Update) => {
                match event.decode_row::<UserProfile>() {
                    Ok(profile) => self.on_profile_updated(&profile.id).await,
                    Err(e) => warn!("[ChatList] 用户事件解析失败: {}", e),
                }
            }
            _ => {}
        }
    }

    /// 新消息：更新预览与未读数并移到首位；未知会话触发一次全量拉取
    pub async fn on_message_inserted(&self, row: MessageRow) {
        if !self.is_live() {
            return;
        }
        let open_chat = self.open_chat.current();
        let updated = {
            let mut state = self.state();
            let next = apply_message_insert(&state.chats, &row, &self.self_id, open_chat.as_deref());
            if let Some(chats) = &next {
                state.chats = chats.clone();
            }
            next
        };

        match updated {
            Some(chats) => {
                debug!("[ChatList] 📥 会话 {} 收到新消息 {}", row.chat_id, row.id);
                self.cache.save(&CacheKey::ChatList, &chats);
                self.notify_changed(chats).await;
            }
            None => {
                info!("[ChatList] 🆕 未知会话 {} 收到消息，触发全量拉取", row.chat_id);
                let _ = self.full_fetch(false).await;
            }
        }
    }

    /// 用户资料更新：丢弃资料缓存，强制刷新节流为每个窗口最多一次
    ///
    /// 窗口内第一次事件立即刷新，之后的事件合并为窗口结束时的一次刷新。
    pub async fn on_profile_updated(self: &Arc<Self>, user_id: &str) {
        if !self.is_live() {
            return;
        }
        self.profiles.invalidate(user_id);

        let now = Instant::now();
        let decision = {
            let mut state = self.state();
            match state.last_profile_refresh {
                Some(last) if now.duration_since(last) < self.throttle => {
                    if state.trailing_refresh_scheduled {
                        RefreshDecision::Coalesced
                    } else {
                        state.trailing_refresh_scheduled = true;
                        RefreshDecision::Trailing(self.throttle - now.duration_since(last))
                    }
                }
                _ => {
                    state.last_profile_refresh = Some(now);
                    RefreshDecision::Now
                }
            }
        };

        match decision {
            RefreshDecision::Now => {
                debug!("[ChatList] 用户 {} 资料更新，立即刷新", user_id);
                let _ = self.full_fetch(true).await;
            }
            RefreshDecision::Trailing(delay) => {
                debug!("[ChatList] 资料更新过于频繁，{:?} 后合并刷新", delay);
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    {
                        let mut state = this.state();
                        state.trailing_refresh_scheduled = false;
                        state.last_profile_refresh = Some(Instant::now());
                    }
                    if this.is_live() {
                        let _ = this.full_fetch(true).await;
                    }
                });
            }
            RefreshDecision::Coalesced => {
                debug!("[ChatList] 资料更新已合并到待执行的刷新");
            }
        }
    }

    /// 设置搜索词并返回过滤结果
    pub fn set_search_query(&self, query: &str) -> Vec<ChatSummary> {
        let mut state = self.state();
        state.search_query = query.to_string();
        filter_chats(&state.chats, &state.search_query)
    }

    /// 基于完整内存列表的过滤结果
    pub fn filtered_chats(&self) -> Vec<ChatSummary> {
        let state = self.state();
        filter_chats(&state.chats, &state.search_query)
    }

    /// 打开会话：记录当前会话并清零其未读数
    pub async fn mark_chat_opened(&self, chat_id: &str) {
        self.open_chat.open(chat_id);
        if !self.is_live() {
            return;
        }
        let updated = {
            let mut state = self.state();
            let next = clear_unread(&state.chats, chat_id);
            if let Some(chats) = &next {
                state.chats = chats.clone();
            }
            next
        };
        if let Some(chats) = updated {
            self.cache.save(&CacheKey::ChatList, &chats);
            self.notify_changed(chats).await;
        }
    }

    pub fn mark_chat_closed(&self, chat_id: &str) {
        self.open_chat.close(chat_id);
    }

    /// “仅对我删除”整个会话：远端把自己加入每条消息的 `deleted_for`，
    /// 本地从列表和缓存中移除。对方不受影响。
    pub async fn delete_chat_for_me(&self, chat_id: &str) -> GatewayResult<()> {
        info!("[ChatList] 🗑️ 仅对我删除会话 {}", chat_id);
        let states = self.gateway.list_deleted_for(chat_id).await?;
        for state in states {
            if state.deleted_for.iter().any(|id| id == &self.self_id) {
                continue;
            }
            let mut deleted_for = state.deleted_for;
            deleted_for.push(self.self_id.clone());
            self.gateway.set_deleted_for(&state.id, &deleted_for).await?;
        }

        self.cache.remove(&CacheKey::Messages(chat_id.to_string()));
        if !self.is_live() {
            return Ok(());
        }
        let remaining = {
            let mut state = self.state();
            state.chats.retain(|c| c.id != chat_id);
            state.chats.clone()
        };
        self.cache.save(&CacheKey::ChatList, &remaining);
        self.notify_changed(remaining).await;
        Ok(())
    }

    async fn notify_changed(&self, chats: Vec<ChatSummary>) {
        let total = total_unread(&chats);
        self.listener.on_chat_list_changed(chats).await;
        self.listener.on_total_unread_count_changed(total).await;
    }
}

#[async_trait]
impl ChatPreviewSink for ChatListReconciler {
    async fn update_chat_preview(&self, chat_id: &str, message: &MessageRow) {
        let in_memory = {
            let mut state = self.state();
            if state.cache_loaded || state.has_fetched {
                let next = apply_preview(&state.chats, chat_id, message);
                if let Some(chats) = &next {
                    state.chats = chats.clone();
                }
                Some(next)
            } else {
                None
            }
        };

        match in_memory {
            Some(Some(chats)) => {
                self.cache.save(&CacheKey::ChatList, &chats);
                if self.is_live() {
                    self.notify_changed(chats).await;
                }
            }
            Some(None) => {
                debug!("[ChatList] 预览更新的会话 {} 不在列表中，忽略", chat_id);
                return;
            }
            None => {
                // 列表还没加载过，直接改缓存快照
                let Some(cached) = self
                    .cache
                    .load::<Vec<ChatSummary>>(&CacheKey::ChatList)
                    .await
                else {
                    return;
                };
                let Some(chats) = apply_preview(&cached, chat_id, message) else {
                    return;
                };
                self.cache.save(&CacheKey::ChatList, &chats);
            }
        }

        self.bus.publish(SyncEvent::ChatPreviewUpdated {
            chat_id: chat_id.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::cache::MemoryKvStorage;
    use crate::im::chat_list::listener::EmptyChatListListener;
    use crate::im::error::GatewayErrorKind;
    use crate::im::gateway::memory::InMemoryGateway;
    use crate::im::test_util::init_test_logger;

    struct Fixture {
        gateway: Arc<InMemoryGateway>,
        cache: LocalCacheStore,
        bus: SyncEventBus,
        open_chat: OpenChatTracker,
        list: Arc<ChatListReconciler>,
    }

    impl Fixture {
        fn new() -> Self {
            init_test_logger();
            let gateway = Arc::new(InMemoryGateway::new());
            gateway.seed_user("u1", "alice", Some("Alice"));
            gateway.seed_user("u2", "bob", Some("Bob Stone"));
            gateway.seed_user("u3", "carol", None);
            let cache = LocalCacheStore::new(Arc::new(MemoryKvStorage::new()));
            Self::with(gateway, cache)
        }

        fn with(gateway: Arc<InMemoryGateway>, cache: LocalCacheStore) -> Self {
            let bus = SyncEventBus::default();
            let open_chat = OpenChatTracker::new();
            let list = Arc::new(ChatListReconciler::new(
                ChatListDeps {
                    self_id: "u1".into(),
                    gateway: gateway.clone(),
                    cache: cache.clone(),
                    bus: bus.clone(),
                    open_chat: open_chat.clone(),
                    profile_refresh_throttle: Duration::from_millis(1000),
                },
                Arc::new(EmptyChatListListener),
            ));
            Self {
                gateway,
                cache,
                bus,
                open_chat,
                list,
            }
        }

        /// c1: alice <-> bob，c2: carol <-> alice（c2 更新）
        fn seed_two_chats(&self) {
            self.gateway.seed_chat("c1", "u1", "u2");
            self.gateway.seed_chat("c2", "u3", "u1");
            self.gateway.seed_message("c1", "u2", "hello");
            self.gateway.seed_message("c2", "u3", "hey");
            self.gateway.seed_message("c2", "u1", "yo");
        }

        fn ids(&self) -> Vec<String> {
            self.list.chats().into_iter().map(|c| c.id).collect()
        }

        fn unread(&self, chat_id: &str) -> u32 {
            self.list
                .chats()
                .into_iter()
                .find(|c| c.id == chat_id)
                .map(|c| c.unread_count)
                .unwrap()
        }
    }

    #[tokio::test]
    async fn full_fetch_builds_sorted_summaries() {
        let f = Fixture::new();
        f.seed_two_chats();

        let chats = f.list.mount().await.unwrap();
        assert_eq!(f.list.phase(), SyncPhase::Ready);
        assert_eq!(f.ids(), vec!["c2", "c1"]);
        assert_eq!(chats[0].other_user.display_name, "carol");
        assert_eq!(chats[0].last_message.as_ref().unwrap().content, "yo");
        assert_eq!(chats[1].other_user.display_name, "Bob Stone");
        assert_eq!(f.unread("c1"), 1);
        assert_eq!(f.unread("c2"), 1);
        assert_eq!(f.list.total_unread(), 2);
    }

    #[tokio::test]
    async fn read_marker_limits_unread_count() {
        let f = Fixture::new();
        f.gateway.seed_chat("c1", "u1", "u2");
        let read = f.gateway.seed_message("c1", "u2", "already read");
        f.gateway
            .upsert_read_marker(&crate::im::types::ReadMarker {
                user_id: "u1".into(),
                chat_id: "c1".into(),
                last_read_at: read.created_at,
            })
            .await
            .unwrap();
        f.gateway.seed_message("c1", "u2", "after read");
        f.gateway.seed_message("c1", "u1", "mine");

        f.list.full_fetch(false).await.unwrap();
        assert_eq!(f.unread("c1"), 1);
    }

    #[tokio::test]
    async fn chat_whose_last_ten_messages_are_deleted_for_me_is_hidden() {
        let f = Fixture::new();
        f.seed_two_chats();
        // 更早的消息仍然可见，但最近 10 条全部对我隐藏
        for i in 0..12 {
            let row = f.gateway.seed_message("c1", "u2", &format!("m{}", i));
            if i >= 2 {
                f.gateway.hide_message_for(&row.id, "u1");
            }
        }

        f.list.full_fetch(false).await.unwrap();
        assert_eq!(f.ids(), vec!["c2"]);
        assert!(!f.gateway.messages_visible_to("c1", "u1").is_empty());
    }

    #[tokio::test]
    async fn insert_for_closed_chat_bumps_unread_by_one_and_moves_to_top() {
        let f = Fixture::new();
        f.seed_two_chats();
        f.list.full_fetch(false).await.unwrap();
        assert_eq!(f.ids(), vec!["c2", "c1"]);
        let before = f.unread("c1");

        let row = f.gateway.seed_message("c1", "u2", "again");
        f.list.on_message_inserted(row).await;

        assert_eq!(f.ids(), vec!["c1", "c2"]);
        assert_eq!(f.unread("c1"), before + 1);
        assert_eq!(
            f.list.chats()[0].last_message.as_ref().unwrap().content,
            "again"
        );

        // 自己发的消息清零
        let row = f.gateway.seed_message("c1", "u1", "mine");
        f.list.on_message_inserted(row).await;
        assert_eq!(f.unread("c1"), 0);
    }

    #[tokio::test]
    async fn insert_for_open_chat_keeps_unread_at_zero() {
        let f = Fixture::new();
        f.seed_two_chats();
        f.list.full_fetch(false).await.unwrap();

        f.list.mark_chat_opened("c1").await;
        assert_eq!(f.open_chat.current().as_deref(), Some("c1"));
        assert_eq!(f.unread("c1"), 0);

        let row = f.gateway.seed_message("c1", "u2", "while open");
        f.list.on_message_inserted(row).await;
        assert_eq!(f.ids()[0], "c1");
        assert_eq!(f.unread("c1"), 0);

        f.list.mark_chat_closed("c1");
        let row = f.gateway.seed_message("c1", "u2", "after close");
        f.list.on_message_inserted(row).await;
        assert_eq!(f.unread("c1"), 1);
    }

    #[tokio::test]
    async fn insert_for_unknown_chat_triggers_one_full_fetch() {
        let f = Fixture::new();
        f.seed_two_chats();
        f.list.full_fetch(false).await.unwrap();
        assert_eq!(f.gateway.calls("list_chats_for"), 1);

        f.gateway.seed_chat("c3", "u2", "u1");
        let row = f.gateway.seed_message("c3", "u2", "new chat");
        f.list.on_message_inserted(row).await;

        assert_eq!(f.gateway.calls("list_chats_for"), 2);
        assert_eq!(f.ids()[0], "c3");
    }

    #[tokio::test]
    async fn cached_list_renders_in_persisted_order() {
        let f = Fixture::new();
        f.seed_two_chats();
        let fetched = f.list.full_fetch(false).await.unwrap();

        // 同一份缓存上的新实例（模拟重启）
        let restarted = Fixture::with(f.gateway.clone(), f.cache.clone());
        assert!(restarted.list.load_cached().await);
        assert_eq!(restarted.list.phase(), SyncPhase::CacheLoaded);
        assert_eq!(restarted.list.chats(), fetched);
        assert_eq!(
            serde_json::to_string(&restarted.list.chats()).unwrap(),
            serde_json::to_string(&fetched).unwrap()
        );
    }

    #[tokio::test]
    async fn failed_fetch_keeps_cached_data_and_reports_error() {
        let f = Fixture::new();
        f.seed_two_chats();
        f.list.full_fetch(false).await.unwrap();

        let restarted = Fixture::with(f.gateway.clone(), f.cache.clone());
        let mut events = restarted.bus.subscribe();
        f.gateway.set_offline(true);

        let err = restarted.list.mount().await.unwrap_err();
        assert_eq!(err.kind, GatewayErrorKind::Network);
        assert_eq!(restarted.list.phase(), SyncPhase::CacheLoaded);
        assert_eq!(restarted.list.chats().len(), 2);
        assert_eq!(
            restarted.list.last_error().map(|e| e.kind),
            Some(GatewayErrorKind::Network)
        );
        assert_eq!(
            events.recv().await.unwrap(),
            SyncEvent::SyncFailed {
                scope: SyncScope::ChatList,
                kind: GatewayErrorKind::Network
            }
        );

        f.gateway.set_offline(false);
        restarted.list.retry().await.unwrap();
        assert_eq!(restarted.list.phase(), SyncPhase::Ready);
        assert!(restarted.list.last_error().is_none());
    }

    #[tokio::test]
    async fn failed_first_fetch_without_cache_stays_uninitialized() {
        let f = Fixture::new();
        f.gateway.set_offline(true);
        assert!(f.list.mount().await.is_err());
        assert_eq!(f.list.phase(), SyncPhase::Uninitialized);
    }

    #[tokio::test]
    async fn delete_chat_for_me_leaves_other_participant_untouched() {
        let f = Fixture::new();
        f.seed_two_chats();
        f.gateway.seed_message("c1", "u1", "reply");
        f.list.full_fetch(false).await.unwrap();

        f.list.delete_chat_for_me("c1").await.unwrap();
        assert_eq!(f.ids(), vec!["c2"]);
        let cached: Vec<ChatSummary> = f.cache.load(&CacheKey::ChatList).await.unwrap();
        assert!(cached.iter().all(|c| c.id != "c1"));

        assert!(f.gateway.messages_visible_to("c1", "u1").is_empty());
        assert_eq!(f.gateway.messages_visible_to("c1", "u2").len(), 2);

        // 对方的视角：同一份远端数据，c1 和全部消息都还在
        let bob = ChatListReconciler::new(
            ChatListDeps {
                self_id: "u2".into(),
                gateway: f.gateway.clone(),
                cache: LocalCacheStore::new(Arc::new(MemoryKvStorage::new())),
                bus: SyncEventBus::default(),
                open_chat: OpenChatTracker::new(),
                profile_refresh_throttle: Duration::from_millis(1000),
            },
            Arc::new(EmptyChatListListener),
        );
        let bobs = bob.full_fetch(false).await.unwrap();
        assert_eq!(bobs.len(), 1);
        assert_eq!(bobs[0].id, "c1");
        assert_eq!(bobs[0].last_message.as_ref().unwrap().content, "reply");

        // 自己重新拉取也不会再出现
        f.list.full_fetch(false).await.unwrap();
        assert_eq!(f.ids(), vec!["c2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn profile_updates_are_throttled_to_one_refresh_per_window() {
        let f = Fixture::new();
        f.seed_two_chats();
        f.list.full_fetch(false).await.unwrap();
        assert_eq!(f.gateway.calls("list_chats_for"), 1);

        f.gateway.rename_user("u3", "caroline");
        for _ in 0..5 {
            f.list.on_profile_updated("u3").await;
        }
        // 首个事件立即刷新，其余合并
        assert_eq!(f.gateway.calls("list_chats_for"), 2);
        assert_eq!(f.list.chats()[0].other_user.display_name, "caroline");

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(f.gateway.calls("list_chats_for"), 3);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        f.list.on_profile_updated("u3").await;
        assert_eq!(f.gateway.calls("list_chats_for"), 4);
    }

    #[tokio::test]
    async fn search_filters_the_in_memory_list() {
        let f = Fixture::new();
        f.seed_two_chats();
        f.list.full_fetch(false).await.unwrap();

        let found = f.list.set_search_query("STONE");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "c1");
        assert_eq!(f.list.filtered_chats(), found);

        assert_eq!(f.list.set_search_query("yo")[0].id, "c2");
        assert_eq!(f.list.set_search_query("").len(), 2);
    }

    #[tokio::test]
    async fn preview_sink_updates_list_and_publishes() {
        let f = Fixture::new();
        f.seed_two_chats();
        f.list.full_fetch(false).await.unwrap();
        let mut events = f.bus.subscribe();

        let row = f.gateway.seed_message("c1", "u1", "sent from thread");
        assert_eq!(f.unread("c1"), 1);
        f.list.update_chat_preview("c1", &row).await;
        assert_eq!(f.ids(), vec!["c1", "c2"]);
        assert_eq!(f.unread("c1"), 0);
        assert_eq!(f.list.total_unread(), 1);
        assert_eq!(
            events.recv().await.unwrap(),
            SyncEvent::ChatPreviewUpdated {
                chat_id: "c1".into()
            }
        );

        let stray = f.gateway.seed_message("nope", "u1", "x");
        f.list.update_chat_preview("nope", &stray).await;
        assert_eq!(f.ids(), vec!["c1", "c2"]);
    }

    #[tokio::test]
    async fn preview_sink_patches_cache_before_first_load() {
        let f = Fixture::new();
        f.seed_two_chats();
        f.list.full_fetch(false).await.unwrap();
        assert_eq!(f.unread("c1"), 1);

        let cold = Fixture::with(f.gateway.clone(), f.cache.clone());
        let row = f.gateway.seed_message("c1", "u1", "from a cold start");
        cold.list.update_chat_preview("c1", &row).await;
        assert!(cold.list.chats().is_empty());

        let cached: Vec<ChatSummary> = f.cache.load(&CacheKey::ChatList).await.unwrap();
        assert_eq!(cached[0].id, "c1");
        assert_eq!(
            cached[0].last_message.as_ref().unwrap().content,
            "from a cold start"
        );
        assert_eq!(cached[0].unread_count, 0);
    }

    #[tokio::test]
    async fn late_results_after_unmount_are_discarded() {
        let f = Fixture::new();
        f.seed_two_chats();
        f.list.unmount();

        f.list.full_fetch(false).await.unwrap();
        assert!(f.list.chats().is_empty());
        let row = f.gateway.seed_message("c1", "u2", "late");
        f.list.on_message_inserted(row).await;
        assert!(f.list.chats().is_empty());
    }
}
