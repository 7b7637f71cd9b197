//! 会话列表本地模型与纯函数
//!
//! 所有变换都基于传入的快照计算新列表，不原地修改，
//! 调用方在同一个临界区内读取快照、计算、写回。

use crate::im::types::{MessageRow, UserProfile};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// 会话另一方
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtherUser {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl OtherUser {
    pub fn from_profile(profile: &UserProfile) -> Self {
        Self {
            id: profile.id.clone(),
            display_name: profile.display_name().to_string(),
            avatar_url: profile.avatar_url.clone(),
        }
    }
}

/// 会话的最后一条消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub sender_id: String,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub file_url: Option<String>,
}

impl LastMessage {
    pub fn from_row(row: &MessageRow) -> Self {
        Self {
            content: row.content.clone(),
            created_at: row.created_at,
            sender_id: row.sender_id.clone(),
            file_type: row.file_type.clone(),
            file_url: row.file_url.clone(),
        }
    }

    /// 列表中展示的预览文本
    pub fn preview_text(&self) -> String {
        match self.file_type.as_deref() {
            Some("event") => return "Event created".to_string(),
            Some("contact") if !self.content.is_empty() => {
                let name = self
                    .content
                    .lines()
                    .find_map(|line| line.strip_prefix("FN:"))
                    .unwrap_or("Contact");
                return format!("Contact shared {}", name);
            }
            Some("audio") => return "Voice Message".to_string(),
            _ => {}
        }

        if self.content.trim().is_empty() {
            let placeholder = match self.file_type.as_deref() {
                Some("image") => "[Image]",
                Some("video") => "[Video]",
                Some("file") => "[File]",
                _ => "",
            };
            return placeholder.to_string();
        }
        self.content.clone()
    }
}

/// 会话摘要（缓存中按此结构持久化）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub other_user: OtherUser,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    #[serde(default)]
    pub unread_count: u32,
}

impl ChatSummary {
    /// 排序依据：最后一条消息时间，没有则用会话创建时间
    pub fn activity_at(&self) -> DateTime<Utc> {
        self.last_message
            .as_ref()
            .map(|m| m.created_at)
            .unwrap_or(self.created_at)
    }

    /// `query` 需已转小写
    fn matches_lowercase(&self, query: &str) -> bool {
        self.other_user.display_name.to_lowercase().contains(query)
            || self
                .last_message
                .as_ref()
                .is_some_and(|m| m.content.to_lowercase().contains(query))
    }
}

/// 按最近活动时间降序（稳定排序）
pub fn sort_by_activity(chats: &mut [ChatSummary]) {
    chats.sort_by(|a, b| b.activity_at().cmp(&a.activity_at()));
}

/// 收到新消息后的列表；会话不在列表中时返回 `None`
///
/// 发送者不是自己且会话未打开时未读数 +1，否则清零；该会话移到首位。
pub fn apply_message_insert(
    chats: &[ChatSummary],
    row: &MessageRow,
    self_id: &str,
    open_chat_id: Option<&str>,
) -> Option<Vec<ChatSummary>> {
    let index = chats.iter().position(|c| c.id == row.chat_id)?;
    let mut next = chats.to_vec();
    let mut chat = next.remove(index);

    chat.last_message = Some(LastMessage::from_row(row));
    let is_open = open_chat_id == Some(row.chat_id.as_str());
    if row.sender_id != self_id && !is_open {
        chat.unread_count += 1;
    } else {
        chat.unread_count = 0;
    }

    next.insert(0, chat);
    Some(next)
}

/// 自己发送成功后更新预览：未读数清零并移到首位；会话不在列表中时返回 `None`
pub fn apply_preview(
    chats: &[ChatSummary],
    chat_id: &str,
    row: &MessageRow,
) -> Option<Vec<ChatSummary>> {
    let index = chats.iter().position(|c| c.id == chat_id)?;
    let mut next = chats.to_vec();
    let mut chat = next.remove(index);
    chat.last_message = Some(LastMessage::from_row(row));
    chat.unread_count = 0;
    next.insert(0, chat);
    Some(next)
}

/// 清零某个会话的未读数；没有变化时返回 `None`
pub fn clear_unread(chats: &[ChatSummary], chat_id: &str) -> Option<Vec<ChatSummary>> {
    let index = chats
        .iter()
        .position(|c| c.id == chat_id && c.unread_count > 0)?;
    let mut next = chats.to_vec();
    next[index].unread_count = 0;
    Some(next)
}

/// 客户端搜索：展示名或最后一条消息内容，不区分大小写
pub fn filter_chats(chats: &[ChatSummary], query: &str) -> Vec<ChatSummary> {
    let query = query.to_lowercase();
    if query.is_empty() {
        return chats.to_vec();
    }
    chats
        .iter()
        .filter(|c| c.matches_lowercase(&query))
        .cloned()
        .collect()
}

pub fn total_unread(chats: &[ChatSummary]) -> u32 {
    chats.iter().map(|c| c.unread_count).sum()
}

/// 当前打开的会话（会话列表与消息线程共享）
#[derive(Debug, Clone, Default)]
pub struct OpenChatTracker {
    current: Arc<RwLock<Option<String>>>,
}

impl OpenChatTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, chat_id: &str) {
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(chat_id.to_string());
    }

    /// 只有当前打开的正是 `chat_id` 时才清除
    pub fn close(&self, chat_id: &str) {
        let mut current = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if current.as_deref() == Some(chat_id) {
            *current = None;
        }
    }

    pub fn current(&self) -> Option<String> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_open(&self, chat_id: &str) -> bool {
        self.current().as_deref() == Some(chat_id)
    }
}
