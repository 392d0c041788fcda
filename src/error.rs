//! 错误类型
//!
//! 传输层错误统一用 [`TransportError`] 表示；协调器边界之外的胶水代码
//! （CLI、配置、本地存储）使用 `anyhow::Result`。

use thiserror::Error;

/// 一次远程调用失败的原因
///
/// 对协调器而言所有变体等价：定义拉取失败 → `ERROR_WHILE_LOADING`，
/// 媒体拉取失败 → 该槽位视为缺失。
#[derive(Debug, Error)]
pub enum TransportError {
    /// 网络不可达、连接被拒、超时等
    #[error("request to {target} failed: {reason}")]
    Unreachable { target: String, reason: String },

    /// 非 200 状态码
    #[error("request to {target} returned status {status}")]
    Status { target: String, status: u16 },

    /// 响应体无法解析或缺少必需字段
    #[error("malformed payload from {target}: {reason}")]
    Malformed { target: String, reason: String },

    /// 响应体携带非空的 `err` 字段
    #[error("service reported error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// 是否为服务端显式返回的业务错误
    pub fn is_protocol(&self) -> bool {
        matches!(self, TransportError::Protocol(_))
    }
}

/// 库对外暴露的构造/配置错误
#[derive(Debug, Error)]
pub enum BlastError {
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("no tokio runtime available; construct the coordinator inside a runtime")]
    NoRuntime,

    #[error(transparent)]
    Transport(#[from] TransportError),
}
