//! 计划校验与危险命令黑名单
//!
//! 黑名单是大小写不敏感的正则片段，计划校验与逐条命令下发共用同一份；命中属于硬校验失败，不可恢复。

use std::sync::OnceLock;

use regex::RegexSet;

use crate::core::AgentError;
use crate::plan::types::ExecutionPlan;

/// 危险命令片段
const DANGEROUS_PATTERNS: &[&str] = &[
    r"\brm\s+(-[a-z]*r[a-z]*f|-[a-z]*f[a-z]*r)\b",
    r"\brm\s+-r\s+-f\b|\brm\s+-f\s+-r\b",
    r"\bsudo\s+shutdown\b",
    r"\bshutdown\s+(-h|-r|now)\b",
    r"\breboot\b",
    r"\bpoweroff\b",
    r"\bhalt\b",
    r"\bmkfs(\.\w+)?\b",
    r"\bdd\s+if=",
    r"\bchmod\s+(-r\s+)?777\b",
    r"\bchmod\s+\+s\b",
    r":\(\)\s*\{\s*:\|:&\s*\};:",
    r">\s*/dev/sd[a-z]",
    r"\b(curl|wget)\b[^|]*\|\s*(sudo\s+)?(ba|z)?sh\b",
];

static DANGEROUS_SET: OnceLock<RegexSet> = OnceLock::new();

fn dangerous_set() -> &'static RegexSet {
    DANGEROUS_SET.get_or_init(|| {
        RegexSet::new(DANGEROUS_PATTERNS.iter().map(|p| format!("(?i){p}"))).unwrap()
    })
}

/// 命中的第一个危险片段
pub fn dangerous_match(command: &str) -> Option<&'static str> {
    dangerous_set()
        .matches(command)
        .iter()
        .next()
        .map(|i| DANGEROUS_PATTERNS[i])
}

pub fn is_dangerous(command: &str) -> bool {
    dangerous_set().is_match(command)
}

/// 单条命令的下发前检查
pub fn validate_command(command: &str) -> Result<(), AgentError> {
    if command.trim().is_empty() {
        return Err(AgentError::InvalidCommand("empty command".to_string()));
    }
    if let Some(pattern) = dangerous_match(command) {
        tracing::warn!(command = %command, pattern, "dangerous command rejected");
        return Err(AgentError::DangerousCommand(command.to_string()));
    }
    Ok(())
}

/// 计划校验：步骤非空、每步命令非空且不在黑名单内（含准备命令与替代命令）
pub fn validate_plan(plan: &ExecutionPlan) -> Result<(), AgentError> {
    if plan.steps.is_empty() {
        return Err(AgentError::InvalidPlan("plan has no steps".to_string()));
    }
    for step in &plan.steps {
        if step.command.trim().is_empty() {
            return Err(AgentError::InvalidPlan(format!("step {} has an empty command", step.id)));
        }
        let extra = step
            .pre
            .iter()
            .flatten()
            .chain(step.alternatives.iter().flatten());
        for command in std::iter::once(&step.command).chain(extra) {
            if is_dangerous(command) {
                return Err(AgentError::DangerousCommand(command.clone()));
            }
        }
    }
    Ok(())
}
