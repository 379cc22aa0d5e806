//! 计划模型与线上 JSON 格式
//!
//! 字段名（camelCase）与判定类型取值是与计划生成方约定的线上契约，必须逐字匹配。

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// 单步默认超时（秒）
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 30;

fn default_step_timeout() -> u64 {
    DEFAULT_STEP_TIMEOUT_SECS
}

fn default_max_total_time() -> u64 {
    600
}

fn default_max_retries() -> u32 {
    2
}

/// 接受字符串、数字、布尔或 null，统一为字符串（计划生成方常把 "0" 写成 0）
fn string_or_scalar<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    })
}

/// 判定类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CriterionType {
    ContainsText,
    NotContainsText,
    ExitCode,
    FileExists,
    FileNotExists,
    DirectoryExists,
    DirectoryNotExists,
    RegexMatch,
    RegexNotMatch,
    OutputLength,
    OutputEmpty,
    OutputNotEmpty,
    CommandSucceeded,
    FileCreated,
    FileModified,
    ContentAdded,
    ProcessCompleted,
    NoErrors,
    ExpectedPattern,
}

impl CriterionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CriterionType::ContainsText => "containsText",
            CriterionType::NotContainsText => "notContainsText",
            CriterionType::ExitCode => "exitCode",
            CriterionType::FileExists => "fileExists",
            CriterionType::FileNotExists => "fileNotExists",
            CriterionType::DirectoryExists => "directoryExists",
            CriterionType::DirectoryNotExists => "directoryNotExists",
            CriterionType::RegexMatch => "regexMatch",
            CriterionType::RegexNotMatch => "regexNotMatch",
            CriterionType::OutputLength => "outputLength",
            CriterionType::OutputEmpty => "outputEmpty",
            CriterionType::OutputNotEmpty => "outputNotEmpty",
            CriterionType::CommandSucceeded => "commandSucceeded",
            CriterionType::FileCreated => "fileCreated",
            CriterionType::FileModified => "fileModified",
            CriterionType::ContentAdded => "contentAdded",
            CriterionType::ProcessCompleted => "processCompleted",
            CriterionType::NoErrors => "noErrors",
            CriterionType::ExpectedPattern => "expectedPattern",
        }
    }
}

impl std::fmt::Display for CriterionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 成功/失败判定（纯值对象）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criterion {
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub kind: CriterionType,
    #[serde(default, deserialize_with = "string_or_scalar")]
    pub value: String,
}

impl Criterion {
    pub fn new(kind: CriterionType, value: impl Into<String>) -> Self {
        let value = value.into();
        Self {
            description: format!("{kind} {value}").trim().to_string(),
            kind,
            value,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// 计划中的一步
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    #[serde(deserialize_with = "string_or_scalar")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub command: String,
    #[serde(default)]
    pub success_criteria: Vec<Criterion>,
    #[serde(default)]
    pub failure_criteria: Vec<Criterion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
    #[serde(default = "default_step_timeout")]
    pub timeout_seconds: u64,
    /// 执行前导出的环境变量
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
    /// 主命令之前执行的准备命令
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre: Option<Vec<String>>,
    /// 恢复失败后依次尝试的替代命令
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternatives: Option<Vec<String>>,
}

impl PlanStep {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }
}

/// 执行计划
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub global_success_criteria: Vec<Criterion>,
    #[serde(default)]
    pub global_failure_criteria: Vec<Criterion>,
    /// 整个计划的墙钟上限（秒）
    #[serde(default = "default_max_total_time")]
    pub max_total_time: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl ExecutionPlan {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn max_total_duration(&self) -> Duration {
        Duration::from_secs(self.max_total_time)
    }
}

/// 单条判定的评估结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriterionResult {
    pub criterion_id: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: CriterionType,
    pub expected_value: String,
    pub actual_value: String,
    pub passed: bool,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Failed,
}

/// 恢复策略标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecoveryStrategy {
    CommandAlternatives,
    ElevatePrivileges,
    ChangeDirectory,
    PathFix,
    CreateDirectory,
    IncreaseTimeout,
    RetryConnection,
    CleanupSpace,
    ForceOperation,
    SimplifyArguments,
    WaitAndRetry,
}

/// 一次尝试的结果（原始执行、重试、恢复尝试各一条）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepExecutionResult {
    pub step_id: String,
    pub status: StepStatus,
    pub command: String,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub exit_code: i32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// 毫秒
    pub duration: u64,
    #[serde(default)]
    pub success_criteria_results: Vec<CriterionResult>,
    #[serde(default)]
    pub failure_criteria_results: Vec<CriterionResult>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub recovery_attempts: Vec<StepExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_recovery_strategy: Option<RecoveryStrategy>,
}

impl StepExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Success
    }

    /// 供错误分类使用的文本：输出 + 错误信息
    pub fn failure_text(&self) -> String {
        match &self.error {
            Some(error) => format!("{}\n{}", self.output, error),
            None => self.output.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlanStatus {
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

/// 整个计划的执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanExecutionResult {
    pub run_id: String,
    pub plan_title: String,
    pub status: PlanStatus,
    pub step_results: Vec<StepExecutionResult>,
    pub global_success_criteria_results: Vec<CriterionResult>,
    pub global_failure_criteria_results: Vec<CriterionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// 毫秒
    pub duration: u64,
}

impl PlanExecutionResult {
    pub fn is_completed(&self) -> bool {
        self.status == PlanStatus::Completed
    }

    /// 简短的人类可读摘要
    pub fn summary(&self) -> String {
        let succeeded = self.step_results.iter().filter(|r| r.succeeded()).count();
        let mut s = format!(
            "Plan \"{}\" {:?}: {} attempt(s), {} succeeded, {} ms",
            self.plan_title,
            self.status,
            self.step_results.len(),
            succeeded,
            self.duration
        );
        if let Some(error) = &self.error {
            s.push_str(&format!("\nError: {error}"));
        }
        s
    }
}
