//! 远端数据网关接口
//!
//! 三张业务表（chats / messages / users_read）加上 users 资料表和对象存储。
//! 本层不做重试，错误按 `GatewayErrorKind` 分类后原样返回。

use crate::im::error::GatewayResult;
use crate::im::types::{ChatRow, DeletionState, MessageRow, NewMessage, ReadMarker, UserProfile};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// 用户参与的所有会话
    async fn list_chats_for(&self, user_id: &str) -> GatewayResult<Vec<ChatRow>>;

    /// 两个用户之间已有的会话（不区分 user1 / user2 顺序）
    async fn find_chat_between(&self, user_a: &str, user_b: &str)
        -> GatewayResult<Option<ChatRow>>;

    async fn create_chat(&self, user_a: &str, user_b: &str) -> GatewayResult<ChatRow>;

    async fn get_user(&self, user_id: &str) -> GatewayResult<UserProfile>;

    /// 用户名前缀搜索（不区分大小写），排除 `exclude_user_id`，按用户名升序
    async fn search_users(
        &self,
        prefix: &str,
        exclude_user_id: &str,
        limit: usize,
    ) -> GatewayResult<Vec<UserProfile>>;

    async fn update_push_token(&self, user_id: &str, token: &str) -> GatewayResult<()>;

    /// 最近 `limit` 条消息，按 `created_at` 降序
    async fn recent_messages(&self, chat_id: &str, limit: usize)
        -> GatewayResult<Vec<MessageRow>>;

    /// 全部消息，按 `created_at` 升序
    async fn list_messages(&self, chat_id: &str) -> GatewayResult<Vec<MessageRow>>;

    /// `created_at > since` 且发送者不是 `reader_id` 的消息数
    async fn count_unread(
        &self,
        chat_id: &str,
        reader_id: &str,
        since: DateTime<Utc>,
    ) -> GatewayResult<u32>;

    async fn insert_message(&self, message: &NewMessage) -> GatewayResult<MessageRow>;

    async fn get_deleted_for(&self, message_id: &str) -> GatewayResult<DeletionState>;

    async fn list_deleted_for(&self, chat_id: &str) -> GatewayResult<Vec<DeletionState>>;

    async fn set_deleted_for(&self, message_id: &str, deleted_for: &[String])
        -> GatewayResult<()>;

    async fn get_read_marker(
        &self,
        user_id: &str,
        chat_id: &str,
    ) -> GatewayResult<Option<ReadMarker>>;

    /// 以 `(user_id, chat_id)` 为冲突键 upsert，后写覆盖
    async fn upsert_read_marker(&self, marker: &ReadMarker) -> GatewayResult<()>;

    async fn upload_object(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> GatewayResult<()>;

    fn public_url(&self, bucket: &str, path: &str) -> String;

    /// 调用服务端函数（推送通知等）
    async fn invoke_function(
        &self,
        name: &str,
        body: serde_json::Value,
    ) -> GatewayResult<serde_json::Value>;
}
