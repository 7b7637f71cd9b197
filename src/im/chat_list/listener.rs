//! 会话列表监听器回调接口

use crate::im::chat_list::models::ChatSummary;
use crate::im::error::GatewayError;
use crate::im::types::MessageRow;
use async_trait::async_trait;

/// 会话列表监听器
#[async_trait]
pub trait ChatListListener: Send + Sync {
    /// 全量拉取开始（`forced` 表示绕过资料缓存的强制刷新）
    async fn on_sync_started(&self, forced: bool);

    /// 全量拉取完成
    async fn on_sync_finished(&self, chat_count: usize);

    /// 全量拉取失败，可调用 `retry` 重试
    async fn on_sync_failed(&self, error: GatewayError);

    /// 列表内容变更（完整快照）
    async fn on_chat_list_changed(&self, chats: Vec<ChatSummary>);

    /// 总未读数变更
    async fn on_total_unread_count_changed(&self, total_unread_count: u32);
}

/// 空实现（默认监听器）
pub struct EmptyChatListListener;

#[async_trait]
impl ChatListListener for EmptyChatListListener {
    async fn on_sync_started(&self, _forced: bool) {}
    async fn on_sync_finished(&self, _chat_count: usize) {}
    async fn on_sync_failed(&self, _error: GatewayError) {}
    async fn on_chat_list_changed(&self, _chats: Vec<ChatSummary>) {}
    async fn on_total_unread_count_changed(&self, _total_unread_count: u32) {}
}

/// 会话列表预览的唯一写入口，消息线程发送成功后调用
#[async_trait]
pub trait ChatPreviewSink: Send + Sync {
    async fn update_chat_preview(&self, chat_id: &str, message: &MessageRow);
}
