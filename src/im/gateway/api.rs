//! REST 网关实现
//!
//! 对接托管后端的 PostgREST 接口（`/rest/v1`）、对象存储（`/storage/v1`）
//! 和服务端函数（`/functions/v1`）。

use crate::im::error::{GatewayError, GatewayResult};
use crate::im::gateway::remote::RemoteGateway;
use crate::im::types::{ChatRow, DeletionState, MessageRow, NewMessage, ReadMarker, UserProfile};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

/// 请求单行对象时使用的 Accept，结果为空时服务端返回 406
const SINGLE_OBJECT: &str = "application/vnd.pgrst.object+json";

/// REST 网关
pub struct RestGateway {
    client: reqwest::Client,
    api_base_url: String,
}

impl RestGateway {
    /// `client` 应该已经通过 [`build_http_client`] 配好认证头
    pub fn new(client: reqwest::Client, api_base_url: impl Into<String>) -> Self {
        Self {
            client,
            api_base_url: api_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.api_base_url, table)
    }

    fn storage_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/storage/v1/object/{}/{}", self.api_base_url, bucket, path)
    }

    fn function_url(&self, name: &str) -> String {
        format!("{}/functions/v1/{}", self.api_base_url, name)
    }
}

/// 创建带认证头的 HTTP 客户端（apikey + Bearer token 通过 default_headers 自动添加）
pub fn build_http_client(anon_key: &str, access_token: &str) -> anyhow::Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static("apikey"),
        HeaderValue::from_str(anon_key).context("无效的 anon key")?,
    );
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", access_token))
            .context("无效的 access token")?,
    );

    reqwest::ClientBuilder::new()
        .default_headers(headers)
        .build()
        .context("创建 HTTP 客户端失败")
}

/// 读取响应体，非 2xx 时按状态码归类
async fn read_body(response: reqwest::Response, operation_name: &str) -> GatewayResult<String> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        error!(
            "[Gateway] {}请求失败，HTTP状态: {}, 响应: {}",
            operation_name, status, body
        );
        return Err(GatewayError::from_status(status.as_u16(), &body));
    }
    debug!("[Gateway] {}请求成功，HTTP状态: {}", operation_name, status);
    Ok(body)
}

/// 处理响应并反序列化
pub async fn handle_rest_response<T: DeserializeOwned>(
    response: reqwest::Response,
    operation_name: &str,
) -> GatewayResult<T> {
    let body = read_body(response, operation_name).await?;
    serde_json::from_str(&body).map_err(|e| {
        error!(
            "[Gateway] {}反序列化失败: {:?}\n原始响应: {}",
            operation_name, e, body
        );
        GatewayError::server(format!("{}响应解析失败: {}", operation_name, e))
    })
}

/// 只检查状态码，忽略响应体
async fn ensure_success(response: reqwest::Response, operation_name: &str) -> GatewayResult<()> {
    read_body(response, operation_name).await.map(|_| ())
}

/// 解析 `Content-Range: 0-9/42` 或 `*/0` 中的总数
pub fn parse_content_range_total(value: &str) -> Option<u32> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}

/// 用户作为任一参与方的过滤条件
fn participant_filter(user_id: &str) -> String {
    format!("(user1_id.eq.{0},user2_id.eq.{0})", user_id)
}

/// 两个用户之间会话的过滤条件（两种列顺序都匹配）
fn pair_filter(user_a: &str, user_b: &str) -> String {
    format!(
        "(and(user1_id.eq.{0},user2_id.eq.{1}),and(user1_id.eq.{1},user2_id.eq.{0}))",
        user_a, user_b
    )
}

fn timestamp_param(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[async_trait]
impl RemoteGateway for RestGateway {
    async fn list_chats_for(&self, user_id: &str) -> GatewayResult<Vec<ChatRow>> {
        debug!("[Gateway] 📡 查询会话列表: user={}", user_id);
        let response = self
            .client
            .get(self.table_url("chats"))
            .query(&[
                ("select", "*".to_string()),
                ("or", participant_filter(user_id)),
                ("order", "created_at.desc".to_string()),
            ])
            .send()
            .await?;
        handle_rest_response(response, "会话列表").await
    }

    async fn find_chat_between(
        &self,
        user_a: &str,
        user_b: &str,
    ) -> GatewayResult<Option<ChatRow>> {
        let response = self
            .client
            .get(self.table_url("chats"))
            .query(&[
                ("select", "*".to_string()),
                ("or", pair_filter(user_a, user_b)),
                ("limit", "1".to_string()),
            ])
            .send()
            .await?;
        let rows: Vec<ChatRow> = handle_rest_response(response, "查找会话").await?;
        Ok(rows.into_iter().next())
    }

    async fn create_chat(&self, user_a: &str, user_b: &str) -> GatewayResult<ChatRow> {
        info!("[Gateway] 📡 创建会话: {} <-> {}", user_a, user_b);
        let response = self
            .client
            .post(self.table_url("chats"))
            .header(ACCEPT, SINGLE_OBJECT)
            .header("Prefer", "return=representation")
            .json(&serde_json::json!({
                "user1_id": user_a,
                "user2_id": user_b,
            }))
            .send()
            .await?;
        handle_rest_response(response, "创建会话").await
    }

    async fn get_user(&self, user_id: &str) -> GatewayResult<UserProfile> {
        let response = self
            .client
            .get(self.table_url("users"))
            .header(ACCEPT, SINGLE_OBJECT)
            .query(&[
                ("select", "id,username,full_name,email,avatar_url".to_string()),
                ("id", format!("eq.{}", user_id)),
            ])
            .send()
            .await?;
        handle_rest_response(response, "用户资料").await
    }

    async fn search_users(
        &self,
        prefix: &str,
        exclude_user_id: &str,
        limit: usize,
    ) -> GatewayResult<Vec<UserProfile>> {
        let response = self
            .client
            .get(self.table_url("users"))
            .query(&[
                ("select", "id,username,full_name,email,avatar_url".to_string()),
                ("username", format!("ilike.{}*", prefix)),
                ("id", format!("neq.{}", exclude_user_id)),
                ("order", "username.asc".to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await?;
        handle_rest_response(response, "搜索用户").await
    }

    async fn update_push_token(&self, user_id: &str, token: &str) -> GatewayResult<()> {
        let response = self
            .client
            .patch(self.table_url("users"))
            .query(&[("id", format!("eq.{}", user_id))])
            .json(&serde_json::json!({ "expo_push_token": token }))
            .send()
            .await?;
        ensure_success(response, "更新推送 token").await
    }

    async fn recent_messages(
        &self,
        chat_id: &str,
        limit: usize,
    ) -> GatewayResult<Vec<MessageRow>> {
        let response = self
            .client
            .get(self.table_url("messages"))
            .query(&[
                ("select", "*".to_string()),
                ("chat_id", format!("eq.{}", chat_id)),
                ("order", "created_at.desc".to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await?;
        handle_rest_response(response, "最近消息").await
    }

    async fn list_messages(&self, chat_id: &str) -> GatewayResult<Vec<MessageRow>> {
        let response = self
            .client
            .get(self.table_url("messages"))
            .query(&[
                ("select", "*".to_string()),
                ("chat_id", format!("eq.{}", chat_id)),
                ("order", "created_at.asc".to_string()),
            ])
            .send()
            .await?;
        handle_rest_response(response, "消息历史").await
    }

    async fn count_unread(
        &self,
        chat_id: &str,
        reader_id: &str,
        since: DateTime<Utc>,
    ) -> GatewayResult<u32> {
        let response = self
            .client
            .head(self.table_url("messages"))
            .header("Prefer", "count=exact")
            .query(&[
                ("select", "id".to_string()),
                ("chat_id", format!("eq.{}", chat_id)),
                ("created_at", format!("gt.{}", timestamp_param(since))),
                ("sender_id", format!("neq.{}", reader_id)),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            error!("[Gateway] 未读计数请求失败，HTTP状态: {}", status);
            return Err(GatewayError::from_status(status.as_u16(), ""));
        }

        let range = response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        parse_content_range_total(range).ok_or_else(|| {
            GatewayError::server(format!("无法解析 Content-Range: {:?}", range))
        })
    }

    async fn insert_message(&self, message: &NewMessage) -> GatewayResult<MessageRow> {
        info!(
            "[Gateway] 📤 插入消息: chat={}, client_key={}",
            message.chat_id, message.client_key
        );
        let response = self
            .client
            .post(self.table_url("messages"))
            .header(ACCEPT, SINGLE_OBJECT)
            .header("Prefer", "return=representation")
            .json(message)
            .send()
            .await?;
        handle_rest_response(response, "发送消息").await
    }

    async fn get_deleted_for(&self, message_id: &str) -> GatewayResult<DeletionState> {
        let response = self
            .client
            .get(self.table_url("messages"))
            .header(ACCEPT, SINGLE_OBJECT)
            .query(&[
                ("select", "id,deleted_for".to_string()),
                ("id", format!("eq.{}", message_id)),
            ])
            .send()
            .await?;
        handle_rest_response(response, "消息删除状态").await
    }

    async fn list_deleted_for(&self, chat_id: &str) -> GatewayResult<Vec<DeletionState>> {
        let response = self
            .client
            .get(self.table_url("messages"))
            .query(&[
                ("select", "id,deleted_for".to_string()),
                ("chat_id", format!("eq.{}", chat_id)),
            ])
            .send()
            .await?;
        handle_rest_response(response, "会话消息删除状态").await
    }

    async fn set_deleted_for(
        &self,
        message_id: &str,
        deleted_for: &[String],
    ) -> GatewayResult<()> {
        let response = self
            .client
            .patch(self.table_url("messages"))
            .query(&[("id", format!("eq.{}", message_id))])
            .json(&serde_json::json!({ "deleted_for": deleted_for }))
            .send()
            .await?;
        ensure_success(response, "更新删除状态").await
    }

    async fn get_read_marker(
        &self,
        user_id: &str,
        chat_id: &str,
    ) -> GatewayResult<Option<ReadMarker>> {
        let response = self
            .client
            .get(self.table_url("users_read"))
            .query(&[
                ("select", "user_id,chat_id,last_read_at".to_string()),
                ("user_id", format!("eq.{}", user_id)),
                ("chat_id", format!("eq.{}", chat_id)),
                ("limit", "1".to_string()),
            ])
            .send()
            .await?;
        let rows: Vec<ReadMarker> = handle_rest_response(response, "已读标记").await?;
        Ok(rows.into_iter().next())
    }

    async fn upsert_read_marker(&self, marker: &ReadMarker) -> GatewayResult<()> {
        let response = self
            .client
            .post(self.table_url("users_read"))
            .query(&[("on_conflict", "user_id,chat_id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(marker)
            .send()
            .await?;
        ensure_success(response, "更新已读标记").await
    }

    async fn upload_object(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> GatewayResult<()> {
        info!(
            "[Gateway] 📤 上传对象: {}/{} ({} 字节)",
            bucket,
            path,
            bytes.len()
        );
        let response = self
            .client
            .post(self.storage_url(bucket, path))
            .header(CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await?;
        ensure_success(response, "上传对象").await
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.api_base_url, bucket, path
        )
    }

    async fn invoke_function(
        &self,
        name: &str,
        body: serde_json::Value,
    ) -> GatewayResult<serde_json::Value> {
        let response = self
            .client
            .post(self.function_url(name))
            .json(&body)
            .send()
            .await?;
        let text = read_body(response, name).await?;
        if text.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        // 函数可能返回纯文本
        Ok(serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text)))
    }
}
