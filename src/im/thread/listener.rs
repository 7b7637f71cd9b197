//! 消息线程监听器回调接口

use crate::im::error::GatewayError;
use crate::im::thread::models::ThreadMessage;
use async_trait::async_trait;

#[async_trait]
pub trait MessageThreadListener: Send + Sync {
    /// 线程内容变更（完整快照）
    async fn on_messages_changed(&self, chat_id: &str, messages: Vec<ThreadMessage>);

    /// 乐观消息发送失败，消息保留为 failed 状态
    async fn on_send_failed(&self, chat_id: &str, temp_id: &str, error: GatewayError);

    /// 历史拉取失败
    async fn on_sync_failed(&self, chat_id: &str, error: GatewayError);
}

/// 空实现（默认监听器）
pub struct EmptyMessageThreadListener;

#[async_trait]
impl MessageThreadListener for EmptyMessageThreadListener {
    async fn on_messages_changed(&self, _chat_id: &str, _messages: Vec<ThreadMessage>) {}
    async fn on_send_failed(&self, _chat_id: &str, _temp_id: &str, _error: GatewayError) {}
    async fn on_sync_failed(&self, _chat_id: &str, _error: GatewayError) {}
}
