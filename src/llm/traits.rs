//! LLM 客户端抽象
//!
//! LlmClient 面向编排层（一次 chat 请求 → 响应）；ChatTransport 面向网关（一次原始 HTTP 往返，
//! 返回状态码、响应头与响应体），便于网关按状态码做重试分类，也便于测试注入。

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::llm::types::{ChatRequest, ChatResponse};

/// 推理服务调用错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Invalid reasoning service configuration: {0}")]
    InvalidConfig(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// 429 且响应体带配额耗尽错误码：不重试
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Request timed out")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl LlmError {
    /// 传输类错误可退避重试；配额与其它 4xx 直接失败
    pub fn is_retriable(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } | LlmError::Timeout | LlmError::Transport(_) => true,
            LlmError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// 编排层使用的客户端
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 一次 HTTP 往返的原始结果（响应头名统一小写）
#[derive(Debug, Clone, Default)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl RawResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// 网关下层的传输：只负责发出请求并原样返回结果，不做重试
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, request: &ChatRequest) -> Result<RawResponse, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(LlmError::Timeout.is_retriable());
        assert!(LlmError::Transport("reset".into()).is_retriable());
        assert!(LlmError::Http { status: 503, body: String::new() }.is_retriable());
        assert!(!LlmError::Http { status: 400, body: String::new() }.is_retriable());
        assert!(!LlmError::QuotaExceeded("insufficient_quota".into()).is_retriable());
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let raw = RawResponse::with_status(429, "").with_header("Retry-After", "3");
        assert_eq!(raw.header("retry-after"), Some("3"));
    }
}
