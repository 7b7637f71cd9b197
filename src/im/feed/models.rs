//! 变更订阅模型

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::mpsc;

/// 可订阅的表
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedTable {
    Messages,
    Users,
}

impl FeedTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedTable::Messages => "messages",
            FeedTable::Users => "users",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "messages" => Some(FeedTable::Messages),
            "users" => Some(FeedTable::Users),
            _ => None,
        }
    }
}

impl fmt::Display for FeedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedOperation {
    Insert,
    Update,
}

/// 行过滤条件，只支持 `column = value`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFilter {
    pub column: String,
    pub value: String,
}

impl RowFilter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    /// 实时服务使用的过滤表达式，如 `chat_id=eq.abc`
    pub fn to_filter_string(&self) -> String {
        format!("{}=eq.{}", self.column, self.value)
    }

    pub fn matches(&self, row: &Value) -> bool {
        match row.get(&self.column) {
            Some(Value::String(s)) => *s == self.value,
            Some(Value::Null) | None => false,
            Some(other) => other.to_string() == self.value,
        }
    }
}

/// 一条行变更
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: FeedTable,
    pub operation: FeedOperation,
    pub row: Value,
}

impl ChangeEvent {
    pub fn decode_row<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.row)
    }
}

pub type SubscriptionId = u64;

/// 订阅句柄；收到的事件不保证与 REST 调用的先后顺序
#[derive(Debug)]
pub struct FeedSubscription {
    pub id: SubscriptionId,
    pub receiver: mpsc::UnboundedReceiver<ChangeEvent>,
}

/// 变更订阅接口
///
/// 传输断开后的重连由实现负责，调用方不能依赖不丢事件。
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(
        &self,
        table: FeedTable,
        filter: Option<RowFilter>,
    ) -> Result<FeedSubscription>;

    async fn unsubscribe(&self, id: SubscriptionId);
}
