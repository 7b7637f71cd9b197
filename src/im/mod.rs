pub mod cache;
pub mod chat_list;
pub mod client;
pub mod db;
pub mod error;
pub mod events;
pub mod feed;
pub mod gateway;
pub mod serialization;
#[cfg(test)]
pub mod test_util;
pub mod thread;
pub mod types;

// 重新导出客户端入口
pub use client::{ChatClient, ClientConfig, ClientListeners};

// 重新导出同步事件
pub use events::{SyncEvent, SyncEventBus, SyncScope};
