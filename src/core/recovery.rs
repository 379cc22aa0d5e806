//! 错误恢复引擎
//!
//! 两步：先按固定子串把失败输出分类为若干错误模式（可多个，按声明顺序尝试），
//! 再为每个模式套用一条有界策略，经由步骤执行原语重新执行，首个成功即停止。
//! 分类表与策略表都是数据，新增模式/策略只需扩展表。

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::core::AgentError;
use crate::plan::types::{PlanStep, RecoveryStrategy, StepExecutionResult};
use crate::plan::validation::is_dangerous;

/// 失败输出的错误模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorPattern {
    CommandNotFound,
    PermissionDenied,
    FileNotFound,
    DirectoryNotFound,
    Timeout,
    ConnectionFailed,
    InsufficientSpace,
    AlreadyExists,
    InvalidArgument,
    ResourceBusy,
}

/// 分类表：模式 → 触发子串（小写）；顺序即尝试顺序
const CLASSIFICATION: &[(ErrorPattern, &[&str])] = &[
    (
        ErrorPattern::CommandNotFound,
        &["command not found", "not recognized as", "no such command", "unknown command"],
    ),
    (
        ErrorPattern::PermissionDenied,
        &["permission denied", "operation not permitted", "access denied", "eacces"],
    ),
    (
        ErrorPattern::FileNotFound,
        &["no such file or directory", "file not found", "cannot find the file", "does not exist"],
    ),
    (
        ErrorPattern::DirectoryNotFound,
        &["no such file or directory", "directory not found", "not a directory", "cannot find the path"],
    ),
    (ErrorPattern::Timeout, &["timed out", "timeout", "time out"]),
    (
        ErrorPattern::ConnectionFailed,
        &[
            "connection refused",
            "connection reset",
            "could not resolve host",
            "network is unreachable",
            "no route to host",
            "connection closed",
        ],
    ),
    (
        ErrorPattern::InsufficientSpace,
        &["no space left on device", "disk full", "insufficient space", "disk quota exceeded"],
    ),
    (ErrorPattern::AlreadyExists, &["file exists", "already exists"]),
    (
        ErrorPattern::InvalidArgument,
        &["invalid option", "invalid argument", "unrecognized option", "illegal option", "unknown option", "usage:"],
    ),
    (
        ErrorPattern::ResourceBusy,
        &["resource busy", "text file busy", "resource temporarily unavailable", "is locked"],
    ),
];

/// 一次失败的分析结果（临时，不持久化）
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorAnalysis {
    pub patterns: Vec<ErrorPattern>,
    pub output: String,
    pub error: Option<String>,
    pub exit_code: i32,
}

impl ErrorAnalysis {
    pub fn of(result: &StepExecutionResult) -> Self {
        Self {
            patterns: classify(&result.failure_text()),
            output: result.output.clone(),
            error: result.error.clone(),
            exit_code: result.exit_code,
        }
    }
}

/// 对输出 + 错误文本做分类
pub fn classify(text: &str) -> Vec<ErrorPattern> {
    let lower = text.to_lowercase();
    CLASSIFICATION
        .iter()
        .filter(|(_, needles)| needles.iter().any(|n| lower.contains(n)))
        .map(|(pattern, _)| *pattern)
        .collect()
}

/// 策略给出的一次重新执行方案
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryPlan {
    pub strategy: RecoveryStrategy,
    /// 主命令之前执行的命令
    pub prep: Vec<String>,
    pub command: String,
    pub timeout: Duration,
    /// 执行前等待
    pub wait: Option<Duration>,
}

/// 策略输入
#[derive(Debug, Clone)]
pub struct StrategyInput<'a> {
    pub command: &'a str,
    pub timeout: Duration,
    pub busy_wait: Duration,
}

impl StrategyInput<'_> {
    fn base(&self) -> &str {
        self.command.split_whitespace().next().unwrap_or("")
    }

    /// 把首词替换为 replacement，保留参数
    fn replace_base(&self, replacement: &str) -> String {
        let trimmed = self.command.trim_start();
        let rest = &trimmed[self.base().len()..];
        format!("{replacement}{rest}")
    }

    fn plan(&self, strategy: RecoveryStrategy, command: String) -> RecoveryPlan {
        RecoveryPlan {
            strategy,
            prep: Vec::new(),
            command,
            timeout: self.timeout,
            wait: None,
        }
    }
}

type Strategy = fn(&StrategyInput<'_>) -> Option<RecoveryPlan>;

/// 策略表：模式 → 策略（每个模式只有一条）
const STRATEGIES: &[(ErrorPattern, Strategy)] = &[
    (ErrorPattern::CommandNotFound, command_alternatives),
    (ErrorPattern::PermissionDenied, elevate_privileges),
    (ErrorPattern::FileNotFound, path_fix),
    (ErrorPattern::DirectoryNotFound, create_directory),
    (ErrorPattern::Timeout, increase_timeout),
    (ErrorPattern::ConnectionFailed, retry_connection),
    (ErrorPattern::InsufficientSpace, cleanup_space),
    (ErrorPattern::AlreadyExists, force_operation),
    (ErrorPattern::InvalidArgument, simplify_arguments),
    (ErrorPattern::ResourceBusy, wait_and_retry),
];

/// 常见命令的替代命令
const ALTERNATIVE_COMMANDS: &[(&str, &[&str])] = &[
    ("ls", &["dir", "list"]),
    ("ps", &["tasklist"]),
    ("ifconfig", &["ip addr"]),
    ("netstat", &["ss"]),
    ("python", &["python3"]),
    ("pip", &["pip3"]),
    ("cat", &["type"]),
    ("clear", &["cls"]),
    ("service", &["systemctl"]),
    ("vim", &["vi"]),
];

fn command_alternatives(input: &StrategyInput<'_>) -> Option<RecoveryPlan> {
    let base = input.base();
    let (_, alternatives) = ALTERNATIVE_COMMANDS.iter().find(|(cmd, _)| *cmd == base)?;
    let alternative = alternatives.first()?;
    Some(input.plan(RecoveryStrategy::CommandAlternatives, input.replace_base(alternative)))
}

fn elevate_privileges(input: &StrategyInput<'_>) -> Option<RecoveryPlan> {
    if input.base() != "sudo" {
        return Some(input.plan(
            RecoveryStrategy::ElevatePrivileges,
            format!("sudo {}", input.command.trim()),
        ));
    }
    if input.command.contains('~') || input.command.contains("$HOME") {
        let mut plan = input.plan(RecoveryStrategy::ChangeDirectory, input.command.to_string());
        plan.prep.push("cd ~".to_string());
        return Some(plan);
    }
    None
}

static DOT_PATH_RE: OnceLock<Regex> = OnceLock::new();
static TILDE_PATH_RE: OnceLock<Regex> = OnceLock::new();

fn path_fix(input: &StrategyInput<'_>) -> Option<RecoveryPlan> {
    let dot = DOT_PATH_RE.get_or_init(|| Regex::new(r"(^|\s)\./").unwrap());
    let tilde = TILDE_PATH_RE.get_or_init(|| Regex::new(r"(^|\s)~/").unwrap());
    let fixed = if dot.is_match(input.command) {
        dot.replace_all(input.command, "${1}$$PWD/").into_owned()
    } else if tilde.is_match(input.command) {
        tilde.replace_all(input.command, "${1}$$HOME/").into_owned()
    } else {
        return None;
    };
    Some(input.plan(RecoveryStrategy::PathFix, fixed))
}

static TARGET_DIR_RE: OnceLock<Regex> = OnceLock::new();

/// 从命令末尾提取目标目录：以 / 结尾或 cd/mkdir 时取整个路径，否则取父目录
pub fn target_directory(command: &str) -> Option<String> {
    let re = TARGET_DIR_RE.get_or_init(|| Regex::new(r"(\S+/[^/\s]+/?)\s*$").unwrap());
    let path = re.captures(command)?.get(1)?.as_str();
    let base = command.split_whitespace().next().unwrap_or("");
    let dir = if path.ends_with('/') || base == "cd" || base == "mkdir" {
        path.trim_end_matches('/')
    } else {
        path.rsplit_once('/').map(|(parent, _)| parent)?
    };
    let dir = dir.trim_matches(|c| c == '"' || c == '\'');
    (!dir.is_empty()).then(|| dir.to_string())
}

fn create_directory(input: &StrategyInput<'_>) -> Option<RecoveryPlan> {
    let dir = target_directory(input.command)?;
    let mut plan = input.plan(RecoveryStrategy::CreateDirectory, input.command.to_string());
    plan.prep.push(format!("mkdir -p {dir}"));
    Some(plan)
}

fn increase_timeout(input: &StrategyInput<'_>) -> Option<RecoveryPlan> {
    let mut plan = input.plan(RecoveryStrategy::IncreaseTimeout, input.command.to_string());
    plan.timeout = input.timeout.saturating_mul(2);
    Some(plan)
}

const SSH_RETRY_OPTS: &str = "-o ConnectTimeout=30 -o ConnectionAttempts=3";

fn retry_connection(input: &StrategyInput<'_>) -> Option<RecoveryPlan> {
    if input.command.contains("ConnectTimeout") {
        return None;
    }
    let command = match input.base() {
        "ssh" | "scp" => input.replace_base(&format!("{} {SSH_RETRY_OPTS}", input.base())),
        "rsync" => input.replace_base(&format!("rsync -e \"ssh {SSH_RETRY_OPTS}\"")),
        _ => return None,
    };
    Some(input.plan(RecoveryStrategy::RetryConnection, command))
}

/// 清理临时文件（只删旧文件，不使用递归强删）
const CLEANUP_COMMANDS: &[&str] = &[
    "find /tmp -type f -atime +2 -delete 2>/dev/null",
    "find \"$HOME/.cache\" -type f -atime +7 -delete 2>/dev/null",
];

fn cleanup_space(input: &StrategyInput<'_>) -> Option<RecoveryPlan> {
    let mut plan = input.plan(RecoveryStrategy::CleanupSpace, input.command.to_string());
    plan.prep = CLEANUP_COMMANDS.iter().map(|c| c.to_string()).collect();
    Some(plan)
}

/// 幂等/强制参数
const FORCE_FLAGS: &[(&str, &str, &str)] = &[
    ("mkdir", "-p", "mkdir -p"),
    ("cp", "-f", "cp -f"),
    ("mv", "-f", "mv -f"),
    ("ln", "-f", "ln -f"),
];

fn force_operation(input: &StrategyInput<'_>) -> Option<RecoveryPlan> {
    let base = input.base();
    let (_, flag, forced) = FORCE_FLAGS.iter().find(|(cmd, _, _)| *cmd == base)?;
    if input.command.split_whitespace().any(|w| w == *flag) {
        return None;
    }
    Some(input.plan(RecoveryStrategy::ForceOperation, input.replace_base(forced)))
}

fn simplify_arguments(input: &StrategyInput<'_>) -> Option<RecoveryPlan> {
    let base = input.base().to_string();
    if base.is_empty() || input.command.trim() == base {
        return None;
    }
    let mut plan = input.plan(RecoveryStrategy::SimplifyArguments, base.clone());
    plan.prep.push(format!("{base} --help"));
    Some(plan)
}

fn wait_and_retry(input: &StrategyInput<'_>) -> Option<RecoveryPlan> {
    let mut plan = input.plan(RecoveryStrategy::WaitAndRetry, input.command.to_string());
    plan.wait = Some(input.busy_wait);
    Some(plan)
}

/// 为一个模式生成恢复方案；不适用或命中危险命令黑名单时返回 None
pub fn plan_for(pattern: ErrorPattern, input: &StrategyInput<'_>) -> Option<RecoveryPlan> {
    let (_, strategy) = STRATEGIES.iter().find(|(p, _)| *p == pattern)?;
    let plan = strategy(input)?;
    if std::iter::once(&plan.command).chain(plan.prep.iter()).any(|c| is_dangerous(c)) {
        tracing::warn!(command = %plan.command, "recovery command rejected by denylist");
        return None;
    }
    Some(plan)
}

/// 步骤执行原语：恢复引擎通过它重新执行命令（与普通执行走同一条路径）
#[async_trait]
pub trait AttemptRunner: Send + Sync {
    /// 执行一次步骤尝试（含判定评估），返回该次尝试的结果
    async fn attempt(
        &self,
        step: &PlanStep,
        command: &str,
        timeout: Duration,
        retry_count: u32,
    ) -> Result<StepExecutionResult, AgentError>;

    /// 执行准备命令；失败只记录
    async fn prepare(&self, command: &str) -> Result<(), AgentError>;
}

/// 恢复引擎
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    busy_wait: Duration,
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl RecoveryEngine {
    pub fn new(busy_wait: Duration) -> Self {
        Self { busy_wait }
    }

    /// 尝试从一次失败中恢复，返回所有恢复尝试（按执行顺序）；若成功，最后一条即成功结果
    pub async fn recover(
        &self,
        step: &PlanStep,
        failed: &StepExecutionResult,
        runner: &dyn AttemptRunner,
    ) -> Result<Vec<StepExecutionResult>, AgentError> {
        let analysis = ErrorAnalysis::of(failed);
        let mut attempts = Vec::new();
        if analysis.patterns.is_empty() {
            return Ok(attempts);
        }
        tracing::info!(step = %step.id, patterns = ?analysis.patterns, "attempting recovery");

        let input = StrategyInput {
            command: &failed.command,
            timeout: step.timeout(),
            busy_wait: self.busy_wait,
        };
        for pattern in &analysis.patterns {
            let Some(plan) = plan_for(*pattern, &input) else {
                tracing::debug!(?pattern, "no applicable recovery strategy");
                continue;
            };
            tracing::info!(
                ?pattern,
                strategy = ?plan.strategy,
                command = %plan.command,
                "applying recovery strategy"
            );
            if let Some(wait) = plan.wait {
                tokio::time::sleep(wait).await;
            }
            for prep in &plan.prep {
                runner.prepare(prep).await?;
            }
            let mut result = runner
                .attempt(step, &plan.command, plan.timeout, failed.retry_count)
                .await?;
            let succeeded = result.succeeded();
            if succeeded {
                result.final_recovery_strategy = Some(plan.strategy);
            }
            attempts.push(result);
            if succeeded {
                tracing::info!(step = %step.id, strategy = ?plan.strategy, "recovery succeeded");
                break;
            }
        }
        Ok(attempts)
    }
}
