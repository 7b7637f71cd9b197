//! 本地缓存存储
//!
//! 读写都是 fail-soft：错误只记录日志，调用方拿到 `None` 或什么也拿不到。
//! 写入交给唯一的后台写任务按提交顺序执行，调用方不等待；
//! `load` 之前会先排空写队列，保证能读到自己刚写的值。

use crate::im::cache::storage::KeyValueStorage;
use crate::im::error::CacheError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// 缓存键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// 会话列表快照
    ChatList,
    /// 单个用户资料快照
    UserProfile(String),
    /// 单个会话的消息列表快照
    Messages(String),
}

impl CacheKey {
    pub fn as_storage_key(&self) -> String {
        match self {
            CacheKey::ChatList => "CACHED_CHATS".to_string(),
            CacheKey::UserProfile(user_id) => format!("CACHED_USER_{}", user_id),
            CacheKey::Messages(chat_id) => format!("CACHED_MESSAGES_{}", chat_id),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_storage_key())
    }
}

enum CacheCommand {
    Put { key: String, value: String },
    Remove { key: String },
    Flush(oneshot::Sender<()>),
}

/// 本地缓存（可克隆，克隆体共享同一个写队列）
#[derive(Clone)]
pub struct LocalCacheStore {
    storage: Arc<dyn KeyValueStorage>,
    writer: mpsc::UnboundedSender<CacheCommand>,
}

impl LocalCacheStore {
    /// 创建缓存并启动后台写任务（需要在 tokio 运行时内调用）
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        let (writer, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(storage.clone(), rx));
        Self { storage, writer }
    }

    /// 读取并反序列化；缺失、损坏或存储失败都返回 `None`
    pub async fn load<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        self.flush().await;
        match self.try_load(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!("[Cache] 读取 {} 失败，忽略: {}", key, e);
                None
            }
        }
    }

    async fn try_load<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<T>, CacheError> {
        let Some(raw) = self.storage.get(&key.as_storage_key()).await? else {
            return Ok(None);
        };
        let value = serde_json::from_str(&raw)?;
        Ok(Some(value))
    }

    /// 序列化后排队写入，不等待落盘
    pub fn save<T: Serialize + ?Sized>(&self, key: &CacheKey, value: &T) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("[Cache] 序列化 {} 失败，跳过写入: {}", key, CacheError::from(e));
                return;
            }
        };
        let cmd = CacheCommand::Put {
            key: key.as_storage_key(),
            value: raw,
        };
        if self.writer.send(cmd).is_err() {
            warn!("[Cache] 写任务已退出，丢弃写入: {}", key);
        }
    }

    /// 排队删除
    pub fn remove(&self, key: &CacheKey) {
        let cmd = CacheCommand::Remove {
            key: key.as_storage_key(),
        };
        if self.writer.send(cmd).is_err() {
            warn!("[Cache] 写任务已退出，丢弃删除: {}", key);
        }
    }

    /// 等待此前排队的写入全部执行完
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.writer.send(CacheCommand::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

async fn run_writer(
    storage: Arc<dyn KeyValueStorage>,
    mut rx: mpsc::UnboundedReceiver<CacheCommand>,
) {
    debug!("[Cache] 写任务启动");
    while let Some(cmd) = rx.recv().await {
        match cmd {
            CacheCommand::Put { key, value } => {
                if let Err(e) = storage.set(&key, &value).await {
                    warn!("[Cache] 写入 {} 失败: {}", key, CacheError::from(e));
                }
            }
            CacheCommand::Remove { key } => {
                if let Err(e) = storage.remove(&key).await {
                    warn!("[Cache] 删除 {} 失败: {}", key, CacheError::from(e));
                }
            }
            CacheCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("[Cache] 写任务退出");
}
