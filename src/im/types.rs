//! 远端表行结构与同步状态
//!
//! 行结构与托管数据库中的表一一对应（字段名为 snake_case），
//! 可直接从 REST 响应或实时变更事件的 `record` 反序列化。

use crate::im::serialization::deserialize_vec_or_null;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `chats` 表：一对一会话
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRow {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub user1_id: String,
    pub user2_id: String,
}

impl ChatRow {
    /// 会话中的另一方
    pub fn other_participant<'a>(&'a self, self_id: &str) -> &'a str {
        if self.user1_id == self_id {
            &self.user2_id
        } else {
            &self.user1_id
        }
    }

    pub fn has_participant(&self, user_id: &str) -> bool {
        self.user1_id == user_id || self.user2_id == user_id
    }
}

/// `messages` 表
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub file_url: Option<String>,
    /// 对哪些用户隐藏（“仅对我删除”）
    #[serde(default, deserialize_with = "deserialize_vec_or_null")]
    pub deleted_for: Vec<String>,
    /// 发送幂等键；旧数据或其他客户端写入的行可能没有
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
}

impl MessageRow {
    pub fn is_deleted_for(&self, user_id: &str) -> bool {
        self.deleted_for.iter().any(|id| id == user_id)
    }
}

/// 插入 `messages` 的请求体（id / created_at 由服务端生成）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewMessage {
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    pub client_key: String,
}

/// `messages` 中与“仅对我删除”相关的列
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeletionState {
    pub id: String,
    #[serde(default, deserialize_with = "deserialize_vec_or_null")]
    pub deleted_for: Vec<String>,
}

/// `users` 表中同步层关心的资料字段
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl UserProfile {
    /// 展示名：优先全名，否则用户名
    pub fn display_name(&self) -> &str {
        match self.full_name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => &self.username,
        }
    }
}

/// `users_read` 表：每个 (user, chat) 一行，upsert 写入
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadMarker {
    pub user_id: String,
    pub chat_id: String,
    pub last_read_at: DateTime<Utc>,
}

/// 列表同步状态机
///
/// `Uninitialized -> CacheLoaded -> Fetching -> Ready`，`Ready -> Fetching` 用于强制刷新。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Uninitialized,
    CacheLoaded,
    Fetching,
    Ready,
}

impl SyncPhase {
    /// 拉取结束（成功或失败）后应回到的状态
    pub fn settled(has_fetched: bool, cache_loaded: bool) -> Self {
        if has_fetched {
            SyncPhase::Ready
        } else if cache_loaded {
            SyncPhase::CacheLoaded
        } else {
            SyncPhase::Uninitialized
        }
    }
}
