//! 同步层错误类型
//!
//! - `GatewayError`：远端调用失败，带分类（网络 / 鉴权 / 不存在 / 服务端），原样返回给调用方
//! - `CacheError`：本地缓存读写失败，只在缓存层内部记录日志，永远不会抛给调用方
//! - `ValidationError`：构造待发送消息时的参数校验失败

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// 远端错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayErrorKind {
    /// 连接失败、超时等传输层错误
    Network,
    /// 401 / 403
    Auth,
    /// 目标行不存在
    NotFound,
    /// 其他服务端错误（含响应无法解析）
    Server,
}

impl fmt::Display for GatewayErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GatewayErrorKind::Network => "network",
            GatewayErrorKind::Auth => "auth",
            GatewayErrorKind::NotFound => "not_found",
            GatewayErrorKind::Server => "server",
        };
        f.write_str(name)
    }
}

/// 远端数据网关错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error: {message}")]
pub struct GatewayError {
    pub kind: GatewayErrorKind,
    pub message: String,
}

/// 网关调用结果
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    pub fn new(kind: GatewayErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::Network, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::Auth, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::NotFound, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::Server, message)
    }

    /// 按 HTTP 状态码和响应体归类
    ///
    /// PostgREST 在请求单行对象但结果为空时返回 406 + `PGRST116`，这里同样视为 NotFound。
    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = match status {
            401 | 403 => GatewayErrorKind::Auth,
            404 => GatewayErrorKind::NotFound,
            406 if body.contains("PGRST116") => GatewayErrorKind::NotFound,
            _ => GatewayErrorKind::Server,
        };
        Self::new(kind, format!("HTTP {}: {}", status, body))
    }

    /// 是否适合在界面上展示“重试”
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            GatewayErrorKind::Network | GatewayErrorKind::Server
        )
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return Self::server(format!("响应解析失败: {}", err));
        }
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), &err.to_string());
        }
        Self::network(err.to_string())
    }
}

/// 本地缓存错误（只在缓存层内部使用）
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("缓存存储失败: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("缓存序列化失败: {0}")]
    Codec(#[from] serde_json::Error),
}

/// 待发送消息校验失败
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("消息内容为空")]
    EmptyMessage,

    #[error("附件地址为空")]
    MissingAttachmentUrl,
}
