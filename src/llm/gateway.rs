//! 推理服务网关：节流 → 抖动 → token 预算 → 带硬上限的调用 → 按状态码分类重试
//!
//! - 200：解析响应，记录实际 token 用量
//! - 429 且配额耗尽：立即失败（QuotaExceeded）
//! - 其它 429：等待 max(下限, Retry-After, x-ratelimit-reset-tokens) 后重试
//! - 5xx / 传输错误 / 超时：指数退避 base * 2^attempt + jitter（封顶）后重试
//! - 其它 4xx：立即失败
//! 节流槽位在任何退避睡眠之前释放，排队中的其它调用方不会被一个调用方的退避阻塞。

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use regex::Regex;
use tokio::time::Instant;

use crate::llm::openai::TokenUsage;
use crate::llm::throttle::Throttle;
use crate::llm::token_budget::{TokenBudgetLimiter, TokenEstimator};
use crate::llm::traits::{ChatTransport, LlmClient, LlmError, RawResponse};
use crate::llm::types::{ChatRequest, ChatResponse};

/// 网关重试参数
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub model: String,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub jitter_min: Duration,
    pub jitter_max: Duration,
    pub rate_limit_floor: Duration,
    /// 与请求自身超时无关的硬上限
    pub hard_ceiling: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            max_attempts: 4,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            jitter_min: Duration::from_millis(100),
            jitter_max: Duration::from_millis(400),
            rate_limit_floor: Duration::from_secs(2),
            hard_ceiling: Duration::from_secs(20),
        }
    }
}

static DURATION_PART_RE: OnceLock<Regex> = OnceLock::new();

/// 解析限流头中的时长："3"、"1.5"（秒）或 "1m30s"、"250ms"、"6m0s"
pub fn parse_reset_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(secs) = value.parse::<f64>() {
        return (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs));
    }
    let re = DURATION_PART_RE
        .get_or_init(|| Regex::new(r"(\d+(?:\.\d+)?)(ms|h|m|s)").unwrap());
    let mut total = 0.0f64;
    let mut matched = false;
    for cap in re.captures_iter(value) {
        let n: f64 = cap[1].parse().ok()?;
        total += match &cap[2] {
            "ms" => n / 1000.0,
            "s" => n,
            "m" => n * 60.0,
            "h" => n * 3600.0,
            _ => 0.0,
        };
        matched = true;
    }
    matched.then(|| Duration::from_secs_f64(total))
}

/// 响应体中的错误详情（优先 error.message，其次 error.code，否则原文）
fn error_detail(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            let err = v.get("error")?;
            err.get("message")
                .or_else(|| err.get("code"))
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

/// 表示额度 / 账单耗尽的错误码；其它 429（含提到 quota 字样的限流文案）都按限流重试
const QUOTA_ERROR_CODES: &[&str] = &["insufficient_quota", "billing_hard_limit_reached", "billing_not_active"];

/// 按 error.code / error.type 判断是否为配额耗尽，不匹配自由文本
fn is_quota_exhausted(body: &str) -> bool {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return false;
    };
    let Some(error) = value.get("error") else {
        return false;
    };
    ["code", "type"]
        .iter()
        .filter_map(|key| error.get(*key).and_then(|v| v.as_str()))
        .any(|code| QUOTA_ERROR_CODES.contains(&code))
}

/// 推理网关；同时实现 LlmClient 供编排层使用
pub struct ReasoningGateway {
    transport: Arc<dyn ChatTransport>,
    throttle: Arc<Throttle>,
    budget: Arc<TokenBudgetLimiter>,
    config: GatewayConfig,
    usage: TokenUsage,
}

impl ReasoningGateway {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        throttle: Arc<Throttle>,
        budget: Arc<TokenBudgetLimiter>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            transport,
            throttle,
            budget,
            config,
            usage: TokenUsage::new(),
        }
    }

    pub fn usage(&self) -> &TokenUsage {
        &self.usage
    }

    fn jitter(&self) -> Duration {
        let (min, max) = (self.config.jitter_min, self.config.jitter_max);
        if max <= min {
            return min;
        }
        let ms = rand::rng().random_range(min.as_millis() as u64..=max.as_millis() as u64);
        Duration::from_millis(ms)
    }

    /// 把一次往返的原始结果分类为成功或错误
    fn classify(&self, raw: RawResponse) -> Result<ChatResponse, LlmError> {
        match raw.status {
            200 => {
                let response: ChatResponse = serde_json::from_str(&raw.body)
                    .map_err(|e| LlmError::MalformedResponse(e.to_string()))?;
                if response.first_message().is_none() {
                    return Err(LlmError::MalformedResponse("response has no choices".to_string()));
                }
                Ok(response)
            }
            429 if is_quota_exhausted(&raw.body) => Err(LlmError::QuotaExceeded(error_detail(&raw.body))),
            429 => {
                let wait = [
                    Some(self.config.rate_limit_floor),
                    raw.header("retry-after").and_then(parse_reset_duration),
                    raw.header("x-ratelimit-reset-tokens").and_then(parse_reset_duration),
                ]
                .into_iter()
                .flatten()
                .max()
                .unwrap_or(self.config.rate_limit_floor);
                Err(LlmError::RateLimited {
                    retry_after_ms: wait.as_millis() as u64,
                })
            }
            status => Err(LlmError::Http {
                status,
                body: error_detail(&raw.body),
            }),
        }
    }

    /// 第 attempt 次（从 0 开始）失败后的等待时长
    fn backoff(&self, error: &LlmError, attempt: u32) -> Duration {
        if let LlmError::RateLimited { retry_after_ms } = error {
            return Duration::from_millis(*retry_after_ms);
        }
        let exp = self
            .config
            .backoff_base
            .saturating_mul(2u32.saturating_pow(attempt));
        exp.min(self.config.backoff_cap) + self.jitter()
    }

    fn record_usage(&self, response: &ChatResponse, raw_len: usize, request_tokens: u64) -> u64 {
        match response.usage {
            Some(u) => {
                self.usage.add(u.prompt_tokens, u.completion_tokens);
                u.completion_tokens
            }
            None => {
                let completion = TokenEstimator::estimate_bytes(raw_len);
                self.usage.add(request_tokens, completion);
                completion
            }
        }
    }

    /// 带节流、预算与重试的一次推理调用
    pub async fn chat(&self, mut request: ChatRequest) -> Result<ChatResponse, LlmError> {
        if request.model.is_empty() {
            request.model = self.config.model.clone();
        }
        let body_len = serde_json::to_vec(&request)
            .map_err(|e| LlmError::InvalidConfig(e.to_string()))?
            .len();
        let estimated = TokenEstimator::estimate_bytes(body_len);
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..max_attempts {
            let permit = self.throttle.acquire().await;
            tokio::time::sleep(self.jitter()).await;
            self.budget.acquire(estimated).await;

            let started = Instant::now();
            let result = match tokio::time::timeout(self.config.hard_ceiling, self.transport.send(&request)).await {
                Ok(result) => result,
                Err(_) => Err(LlmError::Timeout),
            };
            drop(permit);

            let (status, raw_len, outcome) = match result {
                Ok(raw) => (raw.status, raw.body.len(), self.classify(raw)),
                Err(e) => (0, 0, Err(e)),
            };
            tracing::info!(
                attempt = attempt + 1,
                status,
                duration_ms = started.elapsed().as_millis() as u64,
                estimated_tokens = estimated,
                model = %request.model,
                "reasoning call"
            );

            match outcome {
                Ok(response) => {
                    let completion = self.record_usage(&response, raw_len, estimated);
                    self.budget.record(completion).await;
                    return Ok(response);
                }
                Err(e) if !e.is_retriable() => {
                    tracing::error!(error = %e, "reasoning call failed");
                    return Err(e);
                }
                Err(e) => {
                    if attempt + 1 < max_attempts {
                        let delay = self.backoff(&e, attempt);
                        tracing::warn!(
                            error = %e,
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            "reasoning call failed, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        let last = last_error.map(|e| e.to_string()).unwrap_or_default();
        tracing::error!(attempts = max_attempts, last = %last, "reasoning call retries exhausted");
        Err(LlmError::RetriesExhausted {
            attempts: max_attempts,
            last,
        })
    }
}

#[async_trait]
impl LlmClient for ReasoningGateway {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
        ReasoningGateway::chat(self, request).await
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }
}
