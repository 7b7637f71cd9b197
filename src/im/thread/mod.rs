//! 消息线程模块
//!
//! 单个会话的消息列表：缓存秒开、完整历史、乐观发送与实时合并

pub mod listener;
pub mod models;
pub mod service;

pub use listener::{EmptyMessageThreadListener, MessageThreadListener};
pub use models::{MessageStatus, OutgoingMessage, ThreadMessage};
pub use service::{MessageThreadReconciler, ThreadDeps};
