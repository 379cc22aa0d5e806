//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TERMPILOT__*` 覆盖（双下划线表示嵌套，如 `TERMPILOT__THROTTLE__MAX_CONCURRENT=2`）。
//! 所有字段都有默认值，空配置即可用。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::llm::{
    GatewayConfig, LlmError, OpenAiTransport, ReasoningGateway, Throttle, ThrottleConfig,
    TokenBudgetLimiter,
};
use crate::plan::ExecutorConfig;
use crate::react::{OrchestratorConfig, DEFAULT_COMPLETION_PHRASE, DEFAULT_SYSTEM_PROMPT};
use crate::session::{CompletionDetector, PollingConfig, SessionAdapter, SessionBuffer, DEFAULT_OUTPUT_CAP};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmSection,
    pub throttle: ThrottleSection,
    pub session: SessionSection,
    pub executor: ExecutorSection,
    pub orchestrator: OrchestratorSection,
}

/// [llm] 段：推理服务地址、模型与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub model: String,
    pub base_url: String,
    /// 从该环境变量读取 API Key
    pub api_key_env: String,
    pub request_timeout_secs: u64,
    /// 与请求超时无关的硬上限
    pub hard_ceiling_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            request_timeout_secs: 15,
            hard_ceiling_secs: 20,
        }
    }
}

/// [throttle] 段：并发、调用间隔、token 预算与重试退避
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThrottleSection {
    pub max_concurrent: usize,
    pub min_interval_ms: u64,
    pub acquire_timeout_ms: u64,
    pub tokens_per_minute: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
    /// 429 后的最短等待
    pub rate_limit_floor_ms: u64,
}

impl Default for ThrottleSection {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            min_interval_ms: 2000,
            acquire_timeout_ms: 8000,
            tokens_per_minute: 30_000,
            max_attempts: 4,
            backoff_base_ms: 1000,
            backoff_cap_ms: 30_000,
            jitter_min_ms: 100,
            jitter_max_ms: 400,
            rate_limit_floor_ms: 2000,
        }
    }
}

/// [session] 段：完成检测
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// 事件风暴合并窗口
    pub debounce_ms: u64,
    pub poll_interval_ms: u64,
    pub stable_checks: u32,
    pub stuck_timeout_secs: u64,
    pub clear_between_commands: bool,
    pub output_cap_bytes: usize,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            debounce_ms: 80,
            poll_interval_ms: 200,
            stable_checks: 3,
            stuck_timeout_secs: 10,
            clear_between_commands: true,
            output_cap_bytes: DEFAULT_OUTPUT_CAP,
        }
    }
}

/// [executor] 段：计划执行
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub default_timeout_secs: u64,
    pub busy_wait_ms: u64,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            default_timeout_secs: 30,
            busy_wait_ms: 2000,
        }
    }
}

/// [orchestrator] 段：对话式任务
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub max_steps: usize,
    pub completion_phrase: String,
    pub system_prompt: String,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_steps: 20,
            completion_phrase: DEFAULT_COMPLETION_PHRASE.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl AppConfig {
    pub fn gateway_config(&self) -> GatewayConfig {
        let t = &self.throttle;
        GatewayConfig {
            model: self.llm.model.clone(),
            max_attempts: t.max_attempts.max(1),
            backoff_base: Duration::from_millis(t.backoff_base_ms),
            backoff_cap: Duration::from_millis(t.backoff_cap_ms),
            jitter_min: Duration::from_millis(t.jitter_min_ms.min(t.jitter_max_ms)),
            jitter_max: Duration::from_millis(t.jitter_max_ms),
            rate_limit_floor: Duration::from_millis(t.rate_limit_floor_ms),
            hard_ceiling: Duration::from_secs(self.llm.hard_ceiling_secs),
        }
    }

    pub fn throttle_config(&self) -> ThrottleConfig {
        ThrottleConfig {
            max_concurrent: self.throttle.max_concurrent.max(1),
            min_interval: Duration::from_millis(self.throttle.min_interval_ms),
            acquire_timeout: Duration::from_millis(self.throttle.acquire_timeout_ms),
        }
    }

    pub fn polling_config(&self) -> PollingConfig {
        let s = &self.session;
        PollingConfig {
            poll_interval: Duration::from_millis(s.poll_interval_ms.max(1)),
            stable_checks: s.stable_checks.max(1),
            stuck_timeout: Duration::from_secs(s.stuck_timeout_secs),
            clear_between_commands: s.clear_between_commands,
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            default_timeout: Duration::from_secs(self.executor.default_timeout_secs),
            busy_wait: Duration::from_millis(self.executor.busy_wait_ms),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_steps: self.orchestrator.max_steps.max(1),
            completion_phrase: self.orchestrator.completion_phrase.clone(),
            system_prompt: self.orchestrator.system_prompt.clone(),
        }
    }

    /// 会话适配器使用的输出缓冲（按配置封顶）
    pub fn session_buffer(&self) -> Arc<SessionBuffer> {
        SessionBuffer::new(self.session.output_cap_bytes)
    }

    pub fn completion_detector(&self, session: Arc<dyn SessionAdapter>) -> CompletionDetector {
        CompletionDetector::new(session).with_debounce(Duration::from_millis(self.session.debounce_ms))
    }

    /// 构建推理网关；节流器与 token 预算在进程内共享，由调用方传入
    pub fn build_gateway(
        &self,
        throttle: Arc<Throttle>,
        budget: Arc<TokenBudgetLimiter>,
    ) -> Result<ReasoningGateway, LlmError> {
        let transport = OpenAiTransport::new(
            &self.llm.base_url,
            None,
            &self.llm.api_key_env,
            Duration::from_secs(self.llm.request_timeout_secs),
        )?;
        Ok(ReasoningGateway::new(Arc::new(transport), throttle, budget, self.gateway_config()))
    }

    /// 进程级共享的节流器与 token 预算
    pub fn shared_limiters(&self) -> (Arc<Throttle>, Arc<TokenBudgetLimiter>) {
        (
            Throttle::new(self.throttle_config()),
            TokenBudgetLimiter::new(self.throttle.tokens_per_minute),
        )
    }
}

/// 从 config 目录加载配置，环境变量 TERMPILOT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TERMPILOT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TERMPILOT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置（调用方决定是否用新配置重建网关等组件）
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = AppConfig::default();
        let gw = config.gateway_config();
        assert_eq!(gw.max_attempts, 4);
        assert_eq!(gw.hard_ceiling, Duration::from_secs(20));
        let throttle = config.throttle_config();
        assert_eq!(throttle.max_concurrent, 1);
        assert_eq!(throttle.min_interval, Duration::from_secs(2));
        assert_eq!(throttle.acquire_timeout, Duration::from_secs(8));
        assert_eq!(config.polling_config().stuck_timeout, Duration::from_secs(10));
        assert_eq!(config.orchestrator_config().completion_phrase, "TASK_COMPLETE");
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[throttle]\nmax_concurrent = 3\n\n[orchestrator]\nmax_steps = 5").unwrap();

        let config = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.throttle.max_concurrent, 3);
        assert_eq!(config.throttle.min_interval_ms, 2000);
        assert_eq!(config.orchestrator.max_steps, 5);
        assert_eq!(config.llm.model, "gpt-4o-mini");
    }

    #[test]
    fn test_invalid_base_url_is_rejected() {
        let mut config = AppConfig::default();
        config.llm.base_url = "api.example.com".to_string();
        let (throttle, budget) = config.shared_limiters();
        assert!(matches!(
            config.build_gateway(throttle, budget),
            Err(LlmError::InvalidConfig(_))
        ));
    }
}
