//! 内存版网关，供单元测试使用
//!
//! 行为与 REST 网关一致（排序、过滤、冲突键），可模拟断网；
//! 挂上 `FeedHub` 后，写操作会像托管后端一样产生变更事件。

use crate::im::error::{GatewayError, GatewayResult};
use crate::im::feed::{ChangeEvent, FeedHub, FeedOperation, FeedTable};
use crate::im::gateway::remote::RemoteGateway;
use crate::im::types::{ChatRow, DeletionState, MessageRow, NewMessage, ReadMarker, UserProfile};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct GatewayState {
    chats: Vec<ChatRow>,
    messages: Vec<MessageRow>,
    users: HashMap<String, UserProfile>,
    push_tokens: HashMap<String, String>,
    read_markers: HashMap<(String, String), ReadMarker>,
    objects: HashMap<String, Vec<u8>>,
    invocations: Vec<(String, serde_json::Value)>,
}

pub struct InMemoryGateway {
    state: Mutex<GatewayState>,
    calls: Mutex<HashMap<String, usize>>,
    offline: AtomicBool,
    functions_failing: AtomicBool,
    next_id: AtomicU64,
    clock: Mutex<DateTime<Utc>>,
    feed: Option<Arc<FeedHub>>,
}

impl Default for InMemoryGateway {
    fn default() -> Self {
        Self {
            state: Mutex::new(GatewayState::default()),
            calls: Mutex::new(HashMap::new()),
            offline: AtomicBool::new(false),
            functions_failing: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            clock: Mutex::new(Utc::now()),
            feed: None,
        }
    }
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写操作会向 `hub` 发布变更事件
    pub fn with_feed(hub: Arc<FeedHub>) -> Self {
        Self {
            feed: Some(hub),
            ..Self::default()
        }
    }

    fn state(&self) -> MutexGuard<'_, GatewayState> {
        self.state.lock().unwrap()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_functions_failing(&self, failing: bool) {
        self.functions_failing.store(failing, Ordering::SeqCst);
    }

    /// 某个接口被调用的次数（含失败）
    pub fn calls(&self, name: &str) -> usize {
        self.calls.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    fn check(&self, name: &str) -> GatewayResult<()> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default() += 1;
        if self.offline.load(Ordering::SeqCst) {
            return Err(GatewayError::network("offline"));
        }
        Ok(())
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// 单调递增的服务端时间
    fn tick(&self) -> DateTime<Utc> {
        let mut clock = self.clock.lock().unwrap();
        let next = (*clock + Duration::milliseconds(1)).max(Utc::now());
        *clock = next;
        next
    }

    fn emit(&self, table: FeedTable, operation: FeedOperation, row: serde_json::Value) {
        if let Some(feed) = &self.feed {
            feed.publish(ChangeEvent {
                table,
                operation,
                row,
            });
        }
    }

    pub fn seed_user(&self, id: &str, username: &str, full_name: Option<&str>) -> UserProfile {
        let profile = UserProfile {
            id: id.to_string(),
            username: username.to_string(),
            full_name: full_name.map(str::to_string),
            email: Some(format!("{}@example.com", username)),
            avatar_url: None,
        };
        self.state().users.insert(id.to_string(), profile.clone());
        profile
    }

    /// 修改用户名并发布 users 更新事件
    pub fn rename_user(&self, id: &str, username: &str) {
        let updated = {
            let mut state = self.state();
            let Some(profile) = state.users.get_mut(id) else {
                return;
            };
            profile.username = username.to_string();
            profile.clone()
        };
        self.emit(
            FeedTable::Users,
            FeedOperation::Update,
            serde_json::to_value(updated).unwrap(),
        );
    }

    pub fn seed_chat(&self, id: &str, user1: &str, user2: &str) -> ChatRow {
        let chat = ChatRow {
            id: id.to_string(),
            created_at: self.tick(),
            user1_id: user1.to_string(),
            user2_id: user2.to_string(),
        };
        self.state().chats.push(chat.clone());
        chat
    }

    /// 直接写入一条消息，不产生变更事件
    pub fn seed_message(&self, chat_id: &str, sender_id: &str, content: &str) -> MessageRow {
        let row = MessageRow {
            id: self.next_id("msg"),
            chat_id: chat_id.to_string(),
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            created_at: self.tick(),
            file_type: None,
            file_url: None,
            deleted_for: Vec::new(),
            client_key: None,
        };
        self.state().messages.push(row.clone());
        row
    }

    /// 模拟另一个客户端发消息：写入并发布插入事件
    pub fn push_message(&self, chat_id: &str, sender_id: &str, content: &str) -> MessageRow {
        let row = self.seed_message(chat_id, sender_id, content);
        self.emit(
            FeedTable::Messages,
            FeedOperation::Insert,
            serde_json::to_value(&row).unwrap(),
        );
        row
    }

    /// 直接把消息标记为对某用户隐藏，不产生变更事件
    pub fn hide_message_for(&self, message_id: &str, user_id: &str) {
        let mut state = self.state();
        if let Some(row) = state.messages.iter_mut().find(|m| m.id == message_id) {
            if !row.is_deleted_for(user_id) {
                row.deleted_for.push(user_id.to_string());
            }
        }
    }

    /// 某用户可见的消息（升序）
    pub fn messages_visible_to(&self, chat_id: &str, user_id: &str) -> Vec<MessageRow> {
        self.state()
            .messages
            .iter()
            .filter(|m| m.chat_id == chat_id && !m.is_deleted_for(user_id))
            .cloned()
            .collect()
    }

    pub fn read_marker(&self, user_id: &str, chat_id: &str) -> Option<ReadMarker> {
        self.state()
            .read_markers
            .get(&(user_id.to_string(), chat_id.to_string()))
            .cloned()
    }

    pub fn read_marker_count(&self) -> usize {
        self.state().read_markers.len()
    }

    pub fn invocations(&self) -> Vec<(String, serde_json::Value)> {
        self.state().invocations.clone()
    }

    pub fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.state().objects.get(path).cloned()
    }

    pub fn push_token(&self, user_id: &str) -> Option<String> {
        self.state().push_tokens.get(user_id).cloned()
    }

    pub fn chat_count(&self) -> usize {
        self.state().chats.len()
    }
}

#[async_trait]
impl RemoteGateway for InMemoryGateway {
    async fn list_chats_for(&self, user_id: &str) -> GatewayResult<Vec<ChatRow>> {
        self.check("list_chats_for")?;
        let mut chats: Vec<ChatRow> = self
            .state()
            .chats
            .iter()
            .filter(|c| c.has_participant(user_id))
            .cloned()
            .collect();
        chats.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(chats)
    }

    async fn find_chat_between(
        &self,
        user_a: &str,
        user_b: &str,
    ) -> GatewayResult<Option<ChatRow>> {
        self.check("find_chat_between")?;
        Ok(self
            .state()
            .chats
            .iter()
            .find(|c| c.has_participant(user_a) && c.has_participant(user_b))
            .cloned())
    }

    async fn create_chat(&self, user_a: &str, user_b: &str) -> GatewayResult<ChatRow> {
        self.check("create_chat")?;
        let id = self.next_id("chat");
        Ok(self.seed_chat(&id, user_a, user_b))
    }

    async fn get_user(&self, user_id: &str) -> GatewayResult<UserProfile> {
        self.check("get_user")?;
        self.state()
            .users
            .get(user_id)
            .cloned()
            .ok_or_else(|| GatewayError::not_found(format!("user {}", user_id)))
    }

    async fn search_users(
        &self,
        prefix: &str,
        exclude_user_id: &str,
        limit: usize,
    ) -> GatewayResult<Vec<UserProfile>> {
        self.check("search_users")?;
        let prefix = prefix.to_lowercase();
        let mut found: Vec<UserProfile> = self
            .state()
            .users
            .values()
            .filter(|u| u.id != exclude_user_id && u.username.to_lowercase().starts_with(&prefix))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.username.cmp(&b.username));
        found.truncate(limit);
        Ok(found)
    }

    async fn update_push_token(&self, user_id: &str, token: &str) -> GatewayResult<()> {
        self.check("update_push_token")?;
        self.state()
            .push_tokens
            .insert(user_id.to_string(), token.to_string());
        Ok(())
    }

    async fn recent_messages(
        &self,
        chat_id: &str,
        limit: usize,
    ) -> GatewayResult<Vec<MessageRow>> {
        self.check("recent_messages")?;
        let mut rows: Vec<MessageRow> = self
            .state()
            .messages
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn list_messages(&self, chat_id: &str) -> GatewayResult<Vec<MessageRow>> {
        self.check("list_messages")?;
        let mut rows: Vec<MessageRow> = self
            .state()
            .messages
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn count_unread(
        &self,
        chat_id: &str,
        reader_id: &str,
        since: DateTime<Utc>,
    ) -> GatewayResult<u32> {
        self.check("count_unread")?;
        let count = self
            .state()
            .messages
            .iter()
            .filter(|m| m.chat_id == chat_id && m.created_at > since && m.sender_id != reader_id)
            .count();
        Ok(count as u32)
    }

    async fn insert_message(&self, message: &NewMessage) -> GatewayResult<MessageRow> {
        self.check("insert_message")?;
        let row = MessageRow {
            id: self.next_id("msg"),
            chat_id: message.chat_id.clone(),
            sender_id: message.sender_id.clone(),
            content: message.content.clone(),
            created_at: self.tick(),
            file_type: message.file_type.clone(),
            file_url: message.file_url.clone(),
            deleted_for: Vec::new(),
            client_key: Some(message.client_key.clone()),
        };
        self.state().messages.push(row.clone());
        self.emit(
            FeedTable::Messages,
            FeedOperation::Insert,
            serde_json::to_value(&row).unwrap(),
        );
        Ok(row)
    }

    async fn get_deleted_for(&self, message_id: &str) -> GatewayResult<DeletionState> {
        self.check("get_deleted_for")?;
        self.state()
            .messages
            .iter()
            .find(|m| m.id == message_id)
            .map(|m| DeletionState {
                id: m.id.clone(),
                deleted_for: m.deleted_for.clone(),
            })
            .ok_or_else(|| GatewayError::not_found(format!("message {}", message_id)))
    }

    async fn list_deleted_for(&self, chat_id: &str) -> GatewayResult<Vec<DeletionState>> {
        self.check("list_deleted_for")?;
        Ok(self
            .state()
            .messages
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .map(|m| DeletionState {
                id: m.id.clone(),
                deleted_for: m.deleted_for.clone(),
            })
            .collect())
    }

    async fn set_deleted_for(
        &self,
        message_id: &str,
        deleted_for: &[String],
    ) -> GatewayResult<()> {
        self.check("set_deleted_for")?;
        let updated = {
            let mut state = self.state();
            let row = state
                .messages
                .iter_mut()
                .find(|m| m.id == message_id)
                .ok_or_else(|| GatewayError::not_found(format!("message {}", message_id)))?;
            row.deleted_for = deleted_for.to_vec();
            row.clone()
        };
        self.emit(
            FeedTable::Messages,
            FeedOperation::Update,
            serde_json::to_value(&updated).unwrap(),
        );
        Ok(())
    }

    async fn get_read_marker(
        &self,
        user_id: &str,
        chat_id: &str,
    ) -> GatewayResult<Option<ReadMarker>> {
        self.check("get_read_marker")?;
        Ok(self.read_marker(user_id, chat_id))
    }

    async fn upsert_read_marker(&self, marker: &ReadMarker) -> GatewayResult<()> {
        self.check("upsert_read_marker")?;
        self.state().read_markers.insert(
            (marker.user_id.clone(), marker.chat_id.clone()),
            marker.clone(),
        );
        Ok(())
    }

    async fn upload_object(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> GatewayResult<()> {
        self.check("upload_object")?;
        self.state()
            .objects
            .insert(format!("{}/{}", bucket, path), bytes);
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("memory://{}/{}", bucket, path)
    }

    async fn invoke_function(
        &self,
        name: &str,
        body: serde_json::Value,
    ) -> GatewayResult<serde_json::Value> {
        self.check("invoke_function")?;
        self.state().invocations.push((name.to_string(), body));
        if self.functions_failing.load(Ordering::SeqCst) {
            return Err(GatewayError::server("function crashed"));
        }
        Ok(serde_json::Value::Null)
    }
}
