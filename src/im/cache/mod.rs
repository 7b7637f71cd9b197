//! 本地缓存模块
//!
//! 会话列表、用户资料、消息列表的序列化快照

pub mod dao;
pub mod storage;
pub mod store;

pub use dao::SqliteKvStorage;
pub use storage::{KeyValueStorage, MemoryKvStorage};
pub use store::{CacheKey, LocalCacheStore};
