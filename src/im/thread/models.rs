//! 消息线程本地模型与合并规则

use crate::im::error::ValidationError;
use crate::im::serialization::generate_temp_id;
use crate::im::types::{MessageRow, NewMessage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

/// 消息发送状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Sent,
    Failed,
}

/// 线程中的一条消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadMessage {
    /// 服务端 ID；未确认的乐观消息为 `temp-<时间戳>`
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub deleted_for: BTreeSet<String>,
    pub status: MessageStatus,
    #[serde(default)]
    pub client_key: Option<String>,
}

impl ThreadMessage {
    pub fn from_row(row: MessageRow) -> Self {
        Self {
            id: row.id,
            chat_id: row.chat_id,
            sender_id: row.sender_id,
            content: row.content,
            created_at: row.created_at,
            file_type: row.file_type,
            file_url: row.file_url,
            deleted_for: row.deleted_for.into_iter().collect(),
            status: MessageStatus::Sent,
            client_key: row.client_key,
        }
    }

    /// 构造乐观消息（临时 ID，状态 sending）
    pub fn optimistic(
        chat_id: &str,
        sender_id: &str,
        outgoing: &OutgoingMessage,
        client_key: &str,
    ) -> Self {
        Self {
            id: generate_temp_id(),
            chat_id: chat_id.to_string(),
            sender_id: sender_id.to_string(),
            content: outgoing.content.clone(),
            created_at: Utc::now(),
            file_type: outgoing.file_type.clone(),
            file_url: outgoing.file_url.clone(),
            deleted_for: BTreeSet::new(),
            status: MessageStatus::Sending,
            client_key: Some(client_key.to_string()),
        }
    }

    pub fn is_deleted_for(&self, user_id: &str) -> bool {
        self.deleted_for.contains(user_id)
    }
}

/// 待发送的消息（构造时完成校验）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    content: String,
    file_type: Option<String>,
    file_url: Option<String>,
}

impl OutgoingMessage {
    /// 纯文本消息，去掉首尾空白后不能为空
    pub fn text(content: impl Into<String>) -> Result<Self, ValidationError> {
        let content = content.into().trim().to_string();
        if content.is_empty() {
            return Err(ValidationError::EmptyMessage);
        }
        Ok(Self {
            content,
            file_type: None,
            file_url: None,
        })
    }

    /// 附件消息（image / video / audio / file …），说明文字可以为空
    pub fn attachment(
        file_type: impl Into<String>,
        file_url: impl Into<String>,
        caption: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let file_url = file_url.into();
        if file_url.trim().is_empty() {
            return Err(ValidationError::MissingAttachmentUrl);
        }
        Ok(Self {
            content: caption.into().trim().to_string(),
            file_type: Some(file_type.into()),
            file_url: Some(file_url),
        })
    }

    /// 从一条发送失败的消息重建（内容已在首次发送时校验过）
    pub(crate) fn from_failed(message: &ThreadMessage) -> Self {
        Self {
            content: message.content.clone(),
            file_type: message.file_type.clone(),
            file_url: message.file_url.clone(),
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn file_type(&self) -> Option<&str> {
        self.file_type.as_deref()
    }

    pub fn file_url(&self) -> Option<&str> {
        self.file_url.as_deref()
    }

    pub fn to_new_message(&self, chat_id: &str, sender_id: &str, client_key: &str) -> NewMessage {
        NewMessage {
            chat_id: chat_id.to_string(),
            sender_id: sender_id.to_string(),
            content: self.content.clone(),
            file_type: self.file_type.clone(),
            file_url: self.file_url.clone(),
            client_key: client_key.to_string(),
        }
    }
}

/// 把一条服务端行合并进线程
///
/// 匹配顺序：相同服务端 ID -> 相同幂等键 -> （仅当该行没有幂等键）第一条
/// `sending` 且内容、发送者都相同的乐观消息。命中则原位替换，否则追加到末尾。
pub fn merge_incoming(messages: &[ThreadMessage], row: &MessageRow) -> Vec<ThreadMessage> {
    let mut next = messages.to_vec();
    let incoming = ThreadMessage::from_row(row.clone());

    let target = next
        .iter()
        .position(|m| m.id == row.id)
        .or_else(|| {
            let key = row.client_key.as_deref()?;
            next.iter()
                .position(|m| m.client_key.as_deref() == Some(key))
        })
        .or_else(|| {
            if row.client_key.is_some() {
                return None;
            }
            next.iter().position(|m| {
                m.status == MessageStatus::Sending
                    && m.content == row.content
                    && m.sender_id == row.sender_id
            })
        });

    match target {
        Some(index) => next[index] = incoming,
        None => next.push(incoming),
    }
    dedupe_by_id(next)
}

/// 去掉重复 ID，保留第一次出现的位置
pub fn dedupe_by_id(messages: Vec<ThreadMessage>) -> Vec<ThreadMessage> {
    let mut seen = HashSet::new();
    messages
        .into_iter()
        .filter(|m| seen.insert(m.id.clone()))
        .collect()
}
