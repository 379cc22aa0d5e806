//! 错误类型
//!
//! 分层：LLM 调用错误（LlmError，见 llm::traits）由网关产生；AgentError 为编排层统一错误。
//! 判定失败（CriterionResult.passed == false）与步骤失败（StepStatus::Failed）是数据，不是错误。

use thiserror::Error;

use crate::llm::LlmError;

/// 编排过程中可能出现的错误（取消、危险命令、计划非法、会话异常、LLM 调用等）
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Cancelled by user")]
    Cancelled,

    /// 命中危险命令黑名单，属于硬校验失败，不可恢复
    #[error("Dangerous command rejected: {0}")]
    DangerousCommand(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    /// LLM 给出的 tool call 参数无法解析；仅影响该条命令，不终止任务
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// 同一会话已有一个等待完成的命令（调用方时序错误）
    #[error("Another command is still awaiting completion")]
    CompletionPending,

    #[error("Session error: {0}")]
    Session(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Config error: {0}")]
    Config(String),
}

impl AgentError {
    /// 面向用户的简短状态文案（传输/配额错误给出可操作的提示）
    pub fn status_message(&self) -> String {
        match self {
            AgentError::Llm(LlmError::QuotaExceeded(detail)) => format!(
                "Reasoning service quota exhausted: {detail}. Check the billing plan or API key before retrying."
            ),
            AgentError::Llm(e) if e.is_retriable() => {
                format!("Reasoning service unavailable ({e}). Try again shortly.")
            }
            AgentError::Llm(LlmError::RetriesExhausted { attempts, .. }) => format!(
                "Reasoning service did not answer after {attempts} attempts. Try again shortly."
            ),
            AgentError::Cancelled => "Task stopped.".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_status_message_is_actionable() {
        let err = AgentError::from(LlmError::QuotaExceeded("insufficient_quota".to_string()));
        let msg = err.status_message();
        assert!(msg.contains("insufficient_quota"));
        assert!(msg.contains("billing"));
    }

    #[test]
    fn test_transport_status_message() {
        let err = AgentError::from(LlmError::Timeout);
        assert!(err.status_message().contains("Try again"));
    }

    #[test]
    fn test_dangerous_command_display() {
        let err = AgentError::DangerousCommand("rm -rf /".to_string());
        assert_eq!(err.to_string(), "Dangerous command rejected: rm -rf /");
    }
}
