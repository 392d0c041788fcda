//! 远程客户端 - 请求/响应式网络调用
//!
//! 核心逻辑只依赖 [`RemoteClient`] trait；[`HttpRemoteClient`] 是基于
//! reqwest 的默认实现。测试里用 mock 实现替换。

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::error::TransportError;
use crate::model::MediaAsset;

/// 响应错误字段名
pub const ERROR_FIELD: &str = "err";

/// HTTP 方法（服务只用到这两个）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// 一次远程请求
#[derive(Debug, Clone)]
pub struct RemoteRequest {
    pub target: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl RemoteRequest {
    pub fn get(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            method: Method::Get,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            method: Method::Post,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// 带上项目 key 头
    pub fn project_key(self, key: &str) -> Self {
        self.header("key", key)
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// 查找请求头（大小写不敏感）
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// 已解析的 JSON 响应
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPayload(Value);

impl ParsedPayload {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// 顶层 `err` 字段；null 和空字符串视为没有错误
    pub fn error(&self) -> Option<String> {
        match self.0.get(ERROR_FIELD) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.is_empty() => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        }
    }

    /// 若携带错误字段则转换为 [`TransportError::Protocol`]
    pub fn check(self) -> Result<Self, TransportError> {
        match self.error() {
            Some(err) => Err(TransportError::Protocol(err)),
            None => Ok(self),
        }
    }

    /// JSON pointer 访问，如 `/notification/_id`
    pub fn get(&self, pointer: &str) -> Option<&Value> {
        self.0.pointer(pointer)
    }

    /// 取字符串字段，null 或非字符串返回 `None`
    pub fn str_at(&self, pointer: &str) -> Option<&str> {
        self.get(pointer).and_then(Value::as_str)
    }
}

/// 远程客户端接口
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// 发送 JSON 请求；只有 200 且 JSON 对象才算成功。
    /// 错误字段不在这里检查，由调用方 [`ParsedPayload::check`]。
    async fn request(&self, request: RemoteRequest) -> Result<ParsedPayload, TransportError>;

    /// 下载二进制资源（图片）
    async fn download(&self, target: &str) -> Result<MediaAsset, TransportError>;
}

/// 基于 reqwest 的实现
#[derive(Debug, Clone)]
pub struct HttpRemoteClient {
    client: Client,
}

impl HttpRemoteClient {
    /// 创建客户端；超时是唯一的超时来源
    pub fn new(timeout_secs: u64) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| TransportError::Unreachable {
                target: "<client>".to_string(),
                reason: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn request(&self, request: RemoteRequest) -> Result<ParsedPayload, TransportError> {
        let target = request.target.clone();
        let mut builder = match request.method {
            Method::Get => self.client.get(&target),
            Method::Post => self.client.post(&target),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.to_string());
        }

        let response = builder.send().await.map_err(|e| TransportError::Unreachable {
            target: target.clone(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        debug!(target = %target, status = status.as_u16(), "Remote request finished");
        if status.as_u16() != 200 {
            return Err(TransportError::Status {
                target,
                status: status.as_u16(),
            });
        }

        let text = response.text().await.map_err(|e| TransportError::Unreachable {
            target: target.clone(),
            reason: e.to_string(),
        })?;
        let value: Value = serde_json::from_str(&text).map_err(|e| TransportError::Malformed {
            target: target.clone(),
            reason: e.to_string(),
        })?;
        if !value.is_object() {
            return Err(TransportError::Malformed {
                target,
                reason: "expected a JSON object".to_string(),
            });
        }

        Ok(ParsedPayload::new(value))
    }

    async fn download(&self, target: &str) -> Result<MediaAsset, TransportError> {
        let response = self
            .client
            .get(target)
            .send()
            .await
            .map_err(|e| TransportError::Unreachable {
                target: target.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status().as_u16();
        if status != 200 {
            return Err(TransportError::Status {
                target: target.to_string(),
                status,
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let bytes = response.bytes().await.map_err(|e| TransportError::Unreachable {
            target: target.to_string(),
            reason: e.to_string(),
        })?;

        Ok(MediaAsset {
            source_url: target.to_string(),
            content_type,
            bytes: bytes.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_error_field() {
        assert_eq!(ParsedPayload::new(json!({})).error(), None);
        assert_eq!(ParsedPayload::new(json!({"err": null})).error(), None);
        assert_eq!(ParsedPayload::new(json!({"err": ""})).error(), None);
        assert_eq!(
            ParsedPayload::new(json!({"err": "no notification"})).error(),
            Some("no notification".to_string())
        );
        assert_eq!(
            ParsedPayload::new(json!({"err": {"code": 3}})).error(),
            Some("{\"code\":3}".to_string())
        );
    }

    #[test]
    fn test_payload_check() {
        assert!(ParsedPayload::new(json!({"ok": 1})).check().is_ok());
        let err = ParsedPayload::new(json!({"err": "bad key"})).check().unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn test_payload_nested_access() {
        let payload = ParsedPayload::new(json!({
            "notification": {"_id": "n-1", "variation": {"title": "Hi", "image_url": null}}
        }));
        assert_eq!(payload.str_at("/notification/_id"), Some("n-1"));
        assert_eq!(payload.str_at("/notification/variation/title"), Some("Hi"));
        assert_eq!(payload.str_at("/notification/variation/image_url"), None);
        assert_eq!(payload.str_at("/notification/missing"), None);
    }

    #[test]
    fn test_request_builder() {
        let req = RemoteRequest::post("http://x/user/set")
            .project_key("proj")
            .json(json!({"user_id": "u"}));
        assert_eq!(req.method, Method::Post);
        assert_eq!(req.header_value("content-type"), Some("application/json"));
        assert_eq!(req.header_value("key"), Some("proj"));
        assert!(req.body.is_some());

        let req = RemoteRequest::get("http://x");
        assert!(req.headers.is_empty());
        assert!(req.body.is_none());
    }
}
