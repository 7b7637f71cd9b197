//! 变更订阅模块
//!
//! messages / users 表的插入和更新事件

pub mod hub;
pub mod models;
pub mod realtime;

pub use hub::FeedHub;
pub use models::{
    ChangeEvent, ChangeFeed, FeedOperation, FeedSubscription, FeedTable, RowFilter,
    SubscriptionId,
};
pub use realtime::{RealtimeConfig, RealtimeFeed};
