//! OpenAI 兼容 HTTP 传输
//!
//! 通过 reqwest 调用任意 OpenAI 兼容端点（可配置 base_url）；只做一次 POST /chat/completions，
//! 原样返回状态码、响应头与响应体，重试与限流交给网关。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::traits::{ChatTransport, LlmError, RawResponse};
use crate::llm::types::ChatRequest;

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容传输：持有 reqwest Client、端点与密钥
pub struct OpenAiTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl OpenAiTransport {
    /// base_url 形如 `https://api.openai.com/v1`；api_key 为 None 时读取 api_key_env 指定的环境变量
    pub fn new(
        base_url: &str,
        api_key: Option<&str>,
        api_key_env: &str,
        request_timeout: Duration,
    ) -> Result<Self, LlmError> {
        let base = base_url.trim().trim_end_matches('/');
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(LlmError::InvalidConfig(format!("invalid base_url: {base_url:?}")));
        }
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var(api_key_env).ok())
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| LlmError::InvalidConfig(format!("API key not set (env {api_key_env})")))?;

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| LlmError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{base}/chat/completions"),
            api_key,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ChatTransport for OpenAiTransport {
    async fn send(&self, request: &ChatRequest) -> Result<RawResponse, LlmError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Transport(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_base_url() {
        let err = OpenAiTransport::new("api.example.com", Some("k"), "UNUSED", Duration::from_secs(1));
        assert!(matches!(err, Err(LlmError::InvalidConfig(_))));
    }

    #[test]
    fn test_missing_key_is_config_error() {
        let err = OpenAiTransport::new(
            "https://api.example.com/v1",
            None,
            "TERMPILOT_TEST_SURELY_UNSET_KEY",
            Duration::from_secs(1),
        );
        assert!(matches!(err, Err(LlmError::InvalidConfig(_))));
    }

    #[test]
    fn test_endpoint_joins_path() {
        let t = OpenAiTransport::new("https://api.example.com/v1/", Some("k"), "UNUSED", Duration::from_secs(1)).unwrap();
        assert_eq!(t.endpoint(), "https://api.example.com/v1/chat/completions");
    }

    #[test]
    fn test_usage_accumulates() {
        let usage = TokenUsage::new();
        usage.add(10, 5);
        usage.add(1, 1);
        assert_eq!(usage.get(), (11, 6, 17));
    }
}
