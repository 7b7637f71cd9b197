pub mod im;

// 重新导出常用类型和函数，方便外部使用
pub use im::{
    chat_list::{ChatListReconciler, ChatSummary},
    client::{ChatClient, ClientConfig, ClientListeners},
    error::{GatewayError, GatewayErrorKind, ValidationError},
    events::{SyncEvent, SyncScope},
    thread::{MessageStatus, MessageThreadReconciler, OutgoingMessage, ThreadMessage},
};
