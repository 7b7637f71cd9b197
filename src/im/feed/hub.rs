//! 进程内订阅注册表
//!
//! 既可以单独作为进程内的变更源（测试、本地回放），
//! 也被实时连接用来保存订阅并按订阅 ID 投递事件。

use crate::im::feed::models::{
    ChangeEvent, ChangeFeed, FeedSubscription, FeedTable, RowFilter, SubscriptionId,
};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

struct Registration {
    table: FeedTable,
    filter: Option<RowFilter>,
    sender: mpsc::UnboundedSender<ChangeEvent>,
}

#[derive(Default)]
pub struct FeedHub {
    next_id: AtomicU64,
    registrations: Mutex<HashMap<SubscriptionId, Registration>>,
}

impl FeedHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn registrations(&self) -> MutexGuard<'_, HashMap<SubscriptionId, Registration>> {
        self.registrations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, table: FeedTable, filter: Option<RowFilter>) -> FeedSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (sender, receiver) = mpsc::unbounded_channel();
        debug!("[Feed] 新订阅 #{}: {} {:?}", id, table, filter);
        self.registrations().insert(
            id,
            Registration {
                table,
                filter,
                sender,
            },
        );
        FeedSubscription { id, receiver }
    }

    /// 移除订阅，返回是否存在
    pub fn remove(&self, id: SubscriptionId) -> bool {
        self.registrations().remove(&id).is_some()
    }

    pub fn is_live(&self, id: SubscriptionId) -> bool {
        self.registrations().contains_key(&id)
    }

    /// 按表和过滤条件广播，返回送达的订阅数；接收端已关闭的订阅顺带清理
    pub fn publish(&self, event: ChangeEvent) -> usize {
        let mut registrations = self.registrations();
        let mut delivered = 0;
        registrations.retain(|id, reg| {
            if reg.table != event.table {
                return true;
            }
            if let Some(filter) = &reg.filter {
                if !filter.matches(&event.row) {
                    return true;
                }
            }
            if reg.sender.send(event.clone()).is_err() {
                debug!("[Feed] 订阅 #{} 接收端已关闭，移除", id);
                return false;
            }
            delivered += 1;
            true
        });
        delivered
    }

    /// 直接投递给指定订阅
    pub fn deliver(&self, id: SubscriptionId, event: ChangeEvent) -> bool {
        let mut registrations = self.registrations();
        let Some(reg) = registrations.get(&id) else {
            return false;
        };
        if reg.sender.send(event).is_err() {
            registrations.remove(&id);
            return false;
        }
        true
    }

    /// 当前仍有效的订阅（重连后重新加入用）
    pub fn live_registrations(&self) -> Vec<(SubscriptionId, FeedTable, Option<RowFilter>)> {
        let mut live: Vec<_> = self
            .registrations()
            .iter()
            .filter(|(_, reg)| !reg.sender.is_closed())
            .map(|(id, reg)| (*id, reg.table, reg.filter.clone()))
            .collect();
        live.sort_by_key(|(id, _, _)| *id);
        live
    }
}

#[async_trait]
impl ChangeFeed for FeedHub {
    async fn subscribe(
        &self,
        table: FeedTable,
        filter: Option<RowFilter>,
    ) -> Result<FeedSubscription> {
        Ok(self.register(table, filter))
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        self.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::feed::models::FeedOperation;
    use serde_json::json;

    fn message_event(chat_id: &str) -> ChangeEvent {
        ChangeEvent {
            table: FeedTable::Messages,
            operation: FeedOperation::Insert,
            row: json!({"id": "m1", "chat_id": chat_id}),
        }
    }

    #[tokio::test]
    async fn events_are_routed_by_table_and_filter() {
        let hub = FeedHub::new();
        let mut all = hub.subscribe(FeedTable::Messages, None).await.unwrap();
        let mut only_c1 = hub
            .subscribe(FeedTable::Messages, Some(RowFilter::eq("chat_id", "c1")))
            .await
            .unwrap();
        let mut users = hub.subscribe(FeedTable::Users, None).await.unwrap();

        assert_eq!(hub.publish(message_event("c2")), 1);
        assert_eq!(hub.publish(message_event("c1")), 2);

        assert_eq!(all.receiver.recv().await.unwrap(), message_event("c2"));
        assert_eq!(all.receiver.recv().await.unwrap(), message_event("c1"));
        assert_eq!(only_c1.receiver.recv().await.unwrap(), message_event("c1"));
        assert!(users.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribed_and_dropped_receivers_stop_receiving() {
        let hub = FeedHub::new();
        let first = hub.subscribe(FeedTable::Messages, None).await.unwrap();
        let second = hub.subscribe(FeedTable::Messages, None).await.unwrap();
        assert_eq!(hub.live_registrations().len(), 2);

        hub.unsubscribe(first.id).await;
        drop(second);
        assert_eq!(hub.publish(message_event("c1")), 0);
        assert!(hub.live_registrations().is_empty());
        assert!(!hub.deliver(first.id, message_event("c1")));
    }
}
