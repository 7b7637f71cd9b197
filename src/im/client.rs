//! 聊天同步客户端
//!
//! 持有配置、网关、本地缓存、变更订阅、事件总线和会话列表，
//! 负责把实时事件分发给会话列表和已打开的消息线程，并定期重新同步。

use crate::im::cache::{KeyValueStorage, LocalCacheStore, SqliteKvStorage};
use crate::im::chat_list::{
    ChatListDeps, ChatListListener, ChatListReconciler, EmptyChatListListener, OpenChatTracker,
};
use crate::im::db::create_sqlite_pool_with_migration;
use crate::im::error::GatewayResult;
use crate::im::events::{SyncEvent, SyncEventBus};
use crate::im::feed::{
    ChangeFeed, FeedHub, FeedTable, RealtimeConfig, RealtimeFeed, RowFilter, SubscriptionId,
};
use crate::im::gateway::{build_http_client, RemoteGateway, RestGateway};
use crate::im::thread::{
    EmptyMessageThreadListener, MessageThreadListener, MessageThreadReconciler, ThreadDeps,
};
use crate::im::types::{ChatRow, UserProfile};
use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// 用户搜索返回的最大条数
pub const USER_SEARCH_LIMIT: usize = 20;

/// 客户端配置
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// 当前登录用户 ID
    pub user_id: String,
    /// 登录后拿到的 access token
    pub access_token: String,
    /// 后端基础地址，例如 `https://<project>.supabase.co`
    pub api_base_url: String,
    /// 项目公开 key（作为 `apikey` 头发送）
    pub anon_key: String,
    /// 本地缓存使用的 SQLite 数据库 URL
    ///
    /// 例如：`sqlite://chat_cache.db?mode=rwc`
    pub cache_db_url: String,
    /// 定期全量重新同步的间隔
    pub resync_interval: Duration,
    /// 资料更新触发强制刷新的最小间隔
    pub profile_refresh_throttle: Duration,
    /// 是否连接实时服务；关闭时只依赖定期同步
    pub realtime_enabled: bool,
    /// 附件存储桶
    pub attachments_bucket: String,
    /// 发送成功后调用的推送函数，`None` 表示不调用
    pub notify_function: Option<String>,
}

impl ClientConfig {
    /// 创建默认配置
    pub fn new(
        user_id: impl Into<String>,
        access_token: impl Into<String>,
        api_base_url: impl Into<String>,
        anon_key: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            access_token: access_token.into(),
            api_base_url: api_base_url.into(),
            anon_key: anon_key.into(),
            cache_db_url: "sqlite://chat_cache.db?mode=rwc".to_string(),
            resync_interval: Duration::from_secs(60),
            profile_refresh_throttle: Duration::from_millis(1000),
            realtime_enabled: true,
            attachments_bucket: "attachments".to_string(),
            notify_function: Some("send-message-notification".to_string()),
        }
    }
}

/// 各组件的回调监听器
#[derive(Clone)]
pub struct ClientListeners {
    pub chat_list: Arc<dyn ChatListListener>,
    pub thread: Arc<dyn MessageThreadListener>,
}

impl Default for ClientListeners {
    fn default() -> Self {
        Self {
            chat_list: Arc::new(EmptyChatListListener),
            thread: Arc::new(EmptyMessageThreadListener),
        }
    }
}

struct OpenThread {
    reconciler: Arc<MessageThreadReconciler>,
    subscription: SubscriptionId,
    pump: JoinHandle<()>,
}

/// 聊天同步客户端
pub struct ChatClient {
    config: ClientConfig,
    gateway: Arc<dyn RemoteGateway>,
    cache: LocalCacheStore,
    feed: Arc<dyn ChangeFeed>,
    bus: SyncEventBus,
    chat_list: Arc<ChatListReconciler>,
    thread_listener: Arc<dyn MessageThreadListener>,
    threads: Arc<Mutex<HashMap<String, OpenThread>>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChatClient {
    /// 创建本地缓存数据库、HTTP 客户端和实时连接
    pub async fn connect(config: ClientConfig, listeners: ClientListeners) -> Result<Self> {
        info!(
            "[Client] 🔗 初始化客户端 (user={}, api={})",
            config.user_id, config.api_base_url
        );

        let pool = create_sqlite_pool_with_migration(&config.cache_db_url)
            .await
            .context(format!("初始化本地缓存失败: {}", config.cache_db_url))?;
        let storage: Arc<dyn KeyValueStorage> = Arc::new(SqliteKvStorage::new(pool));

        let http_client = build_http_client(&config.anon_key, &config.access_token)?;
        let gateway: Arc<dyn RemoteGateway> =
            Arc::new(RestGateway::new(http_client, config.api_base_url.clone()));

        let feed: Arc<dyn ChangeFeed> = if config.realtime_enabled {
            info!("[Client] 📡 启动实时连接");
            Arc::new(RealtimeFeed::connect(RealtimeConfig::new(
                &config.api_base_url,
                &config.anon_key,
                &config.access_token,
            )))
        } else {
            info!("[Client] 实时连接已关闭，仅依赖定期同步");
            Arc::new(FeedHub::new())
        };

        Ok(Self::from_parts(config, gateway, storage, feed, listeners))
    }

    /// 由现成的组件组装客户端（需要在 tokio 运行时内调用）
    pub fn from_parts(
        config: ClientConfig,
        gateway: Arc<dyn RemoteGateway>,
        storage: Arc<dyn KeyValueStorage>,
        feed: Arc<dyn ChangeFeed>,
        listeners: ClientListeners,
    ) -> Self {
        let cache = LocalCacheStore::new(storage);
        let bus = SyncEventBus::default();
        let chat_list = Arc::new(ChatListReconciler::new(
            ChatListDeps {
                self_id: config.user_id.clone(),
                gateway: gateway.clone(),
                cache: cache.clone(),
                bus: bus.clone(),
                open_chat: OpenChatTracker::new(),
                profile_refresh_throttle: config.profile_refresh_throttle,
            },
            listeners.chat_list,
        ));

        Self {
            config,
            gateway,
            cache,
            feed,
            bus,
            chat_list,
            thread_listener: listeners.thread,
            threads: Arc::new(Mutex::new(HashMap::new())),
            subscriptions: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn chat_list(&self) -> Arc<ChatListReconciler> {
        self.chat_list.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.bus.subscribe()
    }

    /// 挂载会话列表，订阅消息插入和用户更新，启动定期重新同步
    ///
    /// 首次拉取失败不会返回错误：缓存仍然可用，失败通过监听器和事件总线报告。
    pub async fn start(&self) -> Result<()> {
        info!("[Client] 🚀 启动同步 (user={})", self.config.user_id);

        let messages = self
            .feed
            .subscribe(FeedTable::Messages, None)
            .await
            .context("订阅消息变更失败")?;
        let users = self
            .feed
            .subscribe(FeedTable::Users, None)
            .await
            .context("订阅用户变更失败")?;
        self.subscriptions
            .lock()
            .await
            .extend([messages.id, users.id]);

        let mut tasks = self.tasks.lock().await;
        for mut subscription in [messages, users] {
            let chat_list = self.chat_list.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(event) = subscription.receiver.recv().await {
                    chat_list.handle_feed_event(event).await;
                }
                debug!("[Client] 会话列表订阅 #{} 已结束", subscription.id);
            }));
        }

        let chat_list = self.chat_list.clone();
        let threads = self.threads.clone();
        let period = self.config.resync_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // 第一次 tick 立即返回，挂载时已经拉取过
            ticker.tick().await;
            loop {
                ticker.tick().await;
                debug!("[Client] ⏰ 定期重新同步");
                let _ = chat_list.full_fetch(false).await;
                let open: Vec<Arc<MessageThreadReconciler>> = threads
                    .lock()
                    .await
                    .values()
                    .map(|t| t.reconciler.clone())
                    .collect();
                for thread in open {
                    let _ = thread.fetch_history().await;
                }
            }
        }));
        drop(tasks);

        match self.chat_list.mount().await {
            Ok(chats) => info!("[Client] ✅ 会话列表就绪，{} 个会话", chats.len()),
            Err(e) => error!("[Client] ❌ 会话列表首次同步失败: {}", e),
        }
        Ok(())
    }

    /// 打开一个会话：建立消息线程、订阅该会话的消息变更并清零未读
    ///
    /// 已经打开时直接返回现有线程。
    pub async fn open_chat(&self, chat_id: &str) -> Result<Arc<MessageThreadReconciler>> {
        let mut threads = self.threads.lock().await;
        if let Some(open) = threads.get(chat_id) {
            return Ok(open.reconciler.clone());
        }

        info!("[Client] 💬 打开会话 {}", chat_id);
        let reconciler = Arc::new(MessageThreadReconciler::new(
            chat_id,
            ThreadDeps {
                self_id: self.config.user_id.clone(),
                gateway: self.gateway.clone(),
                cache: self.cache.clone(),
                previews: self.chat_list.clone(),
                bus: self.bus.clone(),
                notify_function: self.config.notify_function.clone(),
            },
            self.thread_listener.clone(),
        ));

        let mut subscription = self
            .feed
            .subscribe(FeedTable::Messages, Some(RowFilter::eq("chat_id", chat_id)))
            .await
            .context(format!("订阅会话 {} 失败", chat_id))?;
        let subscription_id = subscription.id;
        let target = reconciler.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = subscription.receiver.recv().await {
                target.on_feed_event(event).await;
            }
        });

        threads.insert(
            chat_id.to_string(),
            OpenThread {
                reconciler: reconciler.clone(),
                subscription: subscription_id,
                pump,
            },
        );
        drop(threads);

        self.chat_list.mark_chat_opened(chat_id).await;
        if let Err(e) = reconciler.mount().await {
            warn!("[Client] 会话 {} 历史拉取失败: {}", chat_id, e);
        }
        Ok(reconciler)
    }

    /// 关闭会话：卸载线程并取消订阅
    pub async fn close_chat(&self, chat_id: &str) {
        let Some(open) = self.threads.lock().await.remove(chat_id) else {
            return;
        };
        info!("[Client] 关闭会话 {}", chat_id);
        open.reconciler.unmount();
        open.pump.abort();
        self.feed.unsubscribe(open.subscription).await;
        self.chat_list.mark_chat_closed(chat_id);
    }

    /// 已打开的消息线程
    pub async fn thread(&self, chat_id: &str) -> Option<Arc<MessageThreadReconciler>> {
        self.threads
            .lock()
            .await
            .get(chat_id)
            .map(|open| open.reconciler.clone())
    }

    /// 按用户名前缀搜索用户（不区分大小写，不含自己）
    pub async fn search_users(&self, prefix: &str) -> GatewayResult<Vec<UserProfile>> {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return Ok(Vec::new());
        }
        self.gateway
            .search_users(prefix, &self.config.user_id, USER_SEARCH_LIMIT)
            .await
    }

    /// 返回与对方已有的会话，没有则创建
    pub async fn start_chat_with(&self, other_user_id: &str) -> GatewayResult<ChatRow> {
        if let Some(chat) = self
            .gateway
            .find_chat_between(&self.config.user_id, other_user_id)
            .await?
        {
            debug!("[Client] 与 {} 的会话已存在: {}", other_user_id, chat.id);
            return Ok(chat);
        }
        let chat = self
            .gateway
            .create_chat(&self.config.user_id, other_user_id)
            .await?;
        info!("[Client] 🆕 创建会话 {} (对方: {})", chat.id, other_user_id);
        Ok(chat)
    }

    /// 上传附件，返回公开访问地址
    pub async fn upload_attachment(
        &self,
        bytes: Vec<u8>,
        file_name: &str,
        content_type: &str,
    ) -> GatewayResult<String> {
        let path = format!("{}_{}", Utc::now().timestamp_millis(), file_name);
        let bucket = &self.config.attachments_bucket;
        info!("[Client] 📎 上传附件 {}/{} ({} 字节)", bucket, path, bytes.len());
        self.gateway
            .upload_object(bucket, &path, bytes, content_type)
            .await?;
        Ok(self.gateway.public_url(bucket, &path))
    }

    pub async fn register_push_token(&self, token: &str) -> GatewayResult<()> {
        self.gateway
            .update_push_token(&self.config.user_id, token)
            .await?;
        info!("[Client] 推送 token 已登记");
        Ok(())
    }

    /// 卸载所有组件、取消订阅并停止后台任务
    pub async fn shutdown(&self) {
        info!("[Client] 🛑 停止同步");
        let open: Vec<String> = self.threads.lock().await.keys().cloned().collect();
        for chat_id in open {
            self.close_chat(&chat_id).await;
        }

        self.chat_list.unmount();
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        let subscriptions: Vec<SubscriptionId> =
            self.subscriptions.lock().await.drain(..).collect();
        for id in subscriptions {
            self.feed.unsubscribe(id).await;
        }
        self.cache.flush().await;
    }
}
