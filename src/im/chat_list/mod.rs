//! 会话列表模块
//!
//! 合并缓存、全量拉取与实时事件，维护带未读数的会话摘要列表

pub mod listener;
pub mod models;
pub mod service;

pub use listener::{ChatListListener, ChatPreviewSink, EmptyChatListListener};
pub use models::{ChatSummary, LastMessage, OpenChatTracker, OtherUser};
pub use service::{ChatListDeps, ChatListReconciler, RECENT_WINDOW};
