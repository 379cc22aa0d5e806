//! 任务主循环（对话式任务）
//!
//! Plan -> 校验 -> 确认 -> 执行（事件驱动完成检测）-> 记录历史 -> 下一轮 Plan。
//! 循环有界，终止条件彼此独立：完成短语 / 无 tool call 的回复、步数上限、重复命令。
//! 危险命令与非法参数只影响该条命令（作为反馈交给下一轮），不终止任务。

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, SessionSupervisor};
use crate::llm::LlmClient;
use crate::memory::{ExecutionHistory, Message, TaskContext};
use crate::plan::validate_command;
use crate::react::planner::{Planner, PlannerOutput, DEFAULT_COMPLETION_PHRASE, DEFAULT_SYSTEM_PROMPT};
use crate::react::TaskEvent;
use crate::session::{strip_command_echo, CompletionDetector, SessionAdapter};

/// 命令输出预览最大字符数
const OUTPUT_PREVIEW_CHARS: usize = 200;
/// 跨任务保留的已结束任务数
const CONTEXT_TASKS: usize = 10;

/// 主循环参数
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_steps: usize,
    pub completion_phrase: String,
    pub system_prompt: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_steps: 20,
            completion_phrase: DEFAULT_COMPLETION_PHRASE.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// 命令确认：返回 false 表示用户拒绝执行
#[async_trait]
pub trait CommandApproval: Send + Sync {
    async fn approve(&self, command: &str, explanation: &str) -> bool;
}

/// 默认：自动确认
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApprove;

#[async_trait]
impl CommandApproval for AutoApprove {
    async fn approve(&self, _command: &str, _explanation: &str) -> bool {
        true
    }
}

/// 任务结束原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEndReason {
    /// 回复中包含完成短语
    Completed,
    /// 回复不含 tool call（直接回答）
    Answered,
    /// 连续两次相同命令
    Repetition(String),
    StepLimit,
    /// 用户拒绝执行提出的命令
    Declined(String),
    Cancelled,
    /// 推理服务不可用或配额耗尽
    ServiceUnavailable,
}

impl TaskEndReason {
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskEndReason::Completed | TaskEndReason::Answered)
    }
}

/// 一次任务的结果
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub reason: TaskEndReason,
    /// 面向用户的结束摘要
    pub summary: String,
    pub history: ExecutionHistory,
}

impl TaskOutcome {
    pub fn finished(&self) -> bool {
        self.reason.is_finished()
    }
}

/// 回复中是否包含完成短语（大小写不敏感）
pub fn is_completion(reply: &str, phrase: &str) -> bool {
    !phrase.is_empty() && reply.to_lowercase().contains(&phrase.to_lowercase())
}

/// 最近两条历史命令相同则返回该命令
pub fn detect_repetition(history: &ExecutionHistory) -> Option<String> {
    match history.last_commands(2).as_slice() {
        [a, b] if a.trim() == b.trim() => Some(b.trim().to_string()),
        _ => None,
    }
}

pub fn step_limit_reached(step: usize, max_steps: usize) -> bool {
    step >= max_steps
}

/// 去掉回复中的完成短语
fn strip_phrase(reply: &str, phrase: &str) -> String {
    if phrase.is_empty() {
        return reply.trim().to_string();
    }
    let found = reply.to_lowercase().find(&phrase.to_lowercase());
    match found.and_then(|i| Some((reply.get(..i)?, reply.get(i + phrase.len()..)?))) {
        Some((before, after)) => format!("{before}{after}")
            .trim()
            .trim_start_matches(|c: char| c == ':' || c == '-')
            .trim()
            .to_string(),
        None => reply.trim().to_string(),
    }
}

fn preview(text: &str) -> String {
    let mut s: String = text.chars().take(OUTPUT_PREVIEW_CHARS).collect();
    if text.chars().count() > OUTPUT_PREVIEW_CHARS {
        s.push_str("...");
    }
    s
}

/// 对话式任务编排器（每个会话一个）
pub struct TaskOrchestrator {
    planner: Planner,
    detector: CompletionDetector,
    supervisor: Arc<SessionSupervisor>,
    approval: Arc<dyn CommandApproval>,
    context: Mutex<TaskContext>,
    event_tx: Option<UnboundedSender<TaskEvent>>,
    config: OrchestratorConfig,
}

impl TaskOrchestrator {
    pub fn new(llm: Arc<dyn LlmClient>, session: Arc<dyn SessionAdapter>, config: OrchestratorConfig) -> Self {
        Self {
            planner: Planner::new(llm, config.system_prompt.clone()),
            detector: CompletionDetector::new(session),
            supervisor: Arc::new(SessionSupervisor::new()),
            approval: Arc::new(AutoApprove),
            context: Mutex::new(TaskContext::new(CONTEXT_TASKS)),
            event_tx: None,
            config,
        }
    }

    pub fn with_approval(mut self, approval: Arc<dyn CommandApproval>) -> Self {
        self.approval = approval;
        self
    }

    /// 与外部（如 UI 的停止按钮）共享同一个监管器
    pub fn with_supervisor(mut self, supervisor: Arc<SessionSupervisor>) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn with_events(mut self, tx: UnboundedSender<TaskEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn with_detector(mut self, detector: CompletionDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn supervisor(&self) -> &Arc<SessionSupervisor> {
        &self.supervisor
    }

    /// 停止当前任务（会话本身不受影响）
    pub fn cancel(&self) {
        self.supervisor.cancel_task();
    }

    fn emit(&self, event: TaskEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    fn prior_context(&self) -> Vec<Message> {
        self.context.lock().unwrap_or_else(|e| e.into_inner()).to_messages()
    }

    /// 执行一个任务直到结束
    pub async fn run(&self, task: &str) -> Result<TaskOutcome, AgentError> {
        let cancel = self.supervisor.begin_task();
        tracing::info!(task = %task, max_steps = self.config.max_steps, "task started");
        let result = self.run_loop(task, &cancel).await;
        self.supervisor.finish_task();

        if let Ok(outcome) = &result {
            tracing::info!(reason = ?outcome.reason, commands = outcome.history.len(), "task ended");
            let (prompt_tokens, completion_tokens, total_tokens) = self.planner.token_usage();
            self.emit(TaskEvent::TokenUsage {
                prompt_tokens,
                completion_tokens,
                total_tokens,
            });
            self.emit(TaskEvent::Completed {
                finished: outcome.finished(),
                summary: outcome.summary.clone(),
            });
            self.context
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .record(task, outcome.summary.clone());
        }
        result
    }

    /// 未完成时的摘要
    fn incomplete(&self, reason: TaskEndReason, detail: &str, history: ExecutionHistory) -> TaskOutcome {
        let summary = format!("Task incomplete: {detail}\n{}", history.summary());
        TaskOutcome {
            reason,
            summary,
            history,
        }
    }

    async fn run_loop(&self, task: &str, cancel: &CancellationToken) -> Result<TaskOutcome, AgentError> {
        let context = self.prior_context();
        let mut history = ExecutionHistory::new();
        let mut feedback: Vec<String> = Vec::new();
        let mut step = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(self.incomplete(TaskEndReason::Cancelled, "stopped by user", history));
            }
            if let Some(command) = detect_repetition(&history) {
                tracing::warn!(command = %command, "same command planned twice in a row, concluding task");
                let summary = format!(
                    "Stopped after `{command}` was planned twice in a row.\n{}",
                    history.summary()
                );
                return Ok(TaskOutcome {
                    reason: TaskEndReason::Repetition(command),
                    summary,
                    history,
                });
            }
            if step_limit_reached(step, self.config.max_steps) {
                let detail = format!("reached the step limit ({})", self.config.max_steps);
                return Ok(self.incomplete(TaskEndReason::StepLimit, &detail, history));
            }
            step += 1;
            self.emit(TaskEvent::StepUpdate {
                step,
                max_steps: self.config.max_steps,
            });
            self.emit(TaskEvent::Thinking);

            let planned = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Ok(self.incomplete(TaskEndReason::Cancelled, "stopped by user", history));
                }
                planned = self.planner.next(&context, task, &history, &feedback) => planned,
            };
            feedback.clear();

            let proposed = match planned {
                Ok(PlannerOutput::Command(proposed)) => proposed,
                Ok(PlannerOutput::Response(reply)) => {
                    let completed = is_completion(&reply, &self.config.completion_phrase);
                    let text = strip_phrase(&reply, &self.config.completion_phrase);
                    let summary = if text.is_empty() { history.summary() } else { text };
                    let reason = if completed {
                        TaskEndReason::Completed
                    } else {
                        TaskEndReason::Answered
                    };
                    return Ok(TaskOutcome {
                        reason,
                        summary,
                        history,
                    });
                }
                Err(AgentError::InvalidCommand(reason)) => {
                    tracing::warn!(reason = %reason, "invalid command from reasoning service");
                    self.emit(TaskEvent::CommandRejected {
                        command: String::new(),
                        reason: reason.clone(),
                    });
                    feedback.push(format!("Your last tool call was invalid ({reason}). Call execute_terminal_command with a JSON object {{\"command\": \"...\"}}."));
                    continue;
                }
                Err(AgentError::Llm(e)) => {
                    let status = AgentError::Llm(e).status_message();
                    tracing::error!(status = %status, "reasoning service call failed");
                    self.emit(TaskEvent::Status { text: status.clone() });
                    return Ok(self.incomplete(TaskEndReason::ServiceUnavailable, &status, history));
                }
                Err(e) => return Err(e),
            };

            if !proposed.explanation.is_empty() {
                self.emit(TaskEvent::ThinkingContent {
                    text: proposed.explanation.clone(),
                });
            }
            if let Err(e) = validate_command(&proposed.command) {
                self.emit(TaskEvent::CommandRejected {
                    command: proposed.command.clone(),
                    reason: e.to_string(),
                });
                feedback.push(format!("Command `{}` was rejected: {e}. Use a safer alternative.", proposed.command));
                continue;
            }

            self.supervisor.set_pending_command(proposed.command.clone());
            self.emit(TaskEvent::CommandProposed {
                command: proposed.command.clone(),
                explanation: proposed.explanation.clone(),
            });
            let approved = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Ok(self.incomplete(TaskEndReason::Cancelled, "stopped by user", history));
                }
                approved = self.approval.approve(&proposed.command, &proposed.explanation) => approved,
            };
            // 取消会清空待确认命令；此时不再执行
            if self.supervisor.take_pending_command().is_none() {
                return Ok(self.incomplete(TaskEndReason::Cancelled, "stopped by user", history));
            }
            if !approved {
                tracing::info!(command = %proposed.command, "command declined");
                self.emit(TaskEvent::CommandRejected {
                    command: proposed.command.clone(),
                    reason: "declined by user".to_string(),
                });
                let detail = format!("`{}` was declined", proposed.command);
                return Ok(self.incomplete(TaskEndReason::Declined(proposed.command), &detail, history));
            }

            tracing::info!(step, command = %proposed.command, "executing command");
            let raw = match self.detector.execute(&proposed.command, cancel).await {
                Ok(raw) => raw,
                Err(AgentError::Cancelled) => {
                    return Ok(self.incomplete(TaskEndReason::Cancelled, "stopped by user", history));
                }
                Err(e) => return Err(e),
            };
            let output = strip_command_echo(&raw, &proposed.command);
            self.emit(TaskEvent::CommandOutput {
                command: proposed.command.clone(),
                preview: preview(&output),
            });
            history.record(proposed.command, proposed.explanation, output);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockLlmClient};
    use crate::session::{MockReply, MockSession};
    use std::time::Duration;

    fn orchestrator(llm: MockLlmClient, session: Arc<MockSession>) -> TaskOrchestrator {
        TaskOrchestrator::new(Arc::new(llm), session, OrchestratorConfig::default())
    }

    fn echo_session() -> Arc<MockSession> {
        Arc::new(MockSession::new(|cmd: &str| MockReply::ok(format!("out of {cmd}"))))
    }

    #[test]
    fn test_detect_repetition() {
        let mut history = ExecutionHistory::new();
        assert!(detect_repetition(&history).is_none());
        history.record("ls", "", "a");
        assert!(detect_repetition(&history).is_none());
        history.record("pwd", "", "/");
        assert!(detect_repetition(&history).is_none());
        history.record("pwd", "", "/");
        assert_eq!(detect_repetition(&history).as_deref(), Some("pwd"));
    }

    #[test]
    fn test_completion_phrase() {
        assert!(is_completion("All done. task_complete", "TASK_COMPLETE"));
        assert!(!is_completion("still working", "TASK_COMPLETE"));
        assert_eq!(strip_phrase("TASK_COMPLETE: disk is fine", "TASK_COMPLETE"), "disk is fine");
        assert!(step_limit_reached(20, 20));
        assert!(!step_limit_reached(19, 20));
    }

    #[tokio::test]
    async fn test_runs_commands_until_complete() {
        let session = echo_session();
        let llm = MockLlmClient::new()
            .then_command("uname -a")
            .then_command("df -h")
            .then_text("TASK_COMPLETE kernel and disk checked");
        let orch = TaskOrchestrator::new(Arc::new(llm), session.clone(), OrchestratorConfig::default())
            .with_detector(CompletionDetector::new(session.clone()).with_debounce(Duration::from_millis(5)));

        let outcome = orch.run("inspect the machine").await.unwrap();
        assert_eq!(outcome.reason, TaskEndReason::Completed);
        assert_eq!(outcome.summary, "kernel and disk checked");
        assert_eq!(outcome.history.len(), 2);
        assert_eq!(outcome.history.steps()[1].output, "out of df -h");
        assert_eq!(session.sent_commands(), vec!["uname -a", "df -h"]);
    }

    #[tokio::test]
    async fn test_dangerous_command_is_fed_back_not_executed() {
        let session = echo_session();
        let llm = Arc::new(
            MockLlmClient::new()
                .then_command("rm -rf /var/tmp/cache")
                .then_command("ls /var/tmp")
                .then_text("TASK_COMPLETE"),
        );
        let orch = TaskOrchestrator::new(llm.clone(), session.clone(), OrchestratorConfig::default())
            .with_detector(CompletionDetector::new(session.clone()).with_debounce(Duration::ZERO));

        let outcome = orch.run("clean cache").await.unwrap();
        assert!(outcome.finished());
        assert_eq!(session.sent_commands(), vec!["ls /var/tmp"]);
        let second = &llm.requests()[1];
        assert!(second.messages.last().unwrap().content.contains("was rejected"));
    }

    #[tokio::test]
    async fn test_invalid_arguments_do_not_abort() {
        let llm = MockLlmClient::new()
            .then(Ok(crate::llm::ChatResponse::from_tool_call(
                crate::tools::EXECUTE_TERMINAL_COMMAND,
                "{oops",
            )))
            .then_text("TASK_COMPLETE nothing to do");
        let outcome = orchestrator(llm, echo_session()).run("noop").await.unwrap();
        assert_eq!(outcome.reason, TaskEndReason::Completed);
    }

    #[tokio::test]
    async fn test_quota_error_ends_task_with_status() {
        let llm = MockLlmClient::new().then_error(LlmError::QuotaExceeded("insufficient_quota".to_string()));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let outcome = orchestrator(llm, echo_session()).with_events(tx).run("anything").await.unwrap();
        assert_eq!(outcome.reason, TaskEndReason::ServiceUnavailable);
        assert!(outcome.summary.starts_with("Task incomplete"));
        assert!(outcome.summary.contains("quota"));

        let mut saw_status = false;
        while let Ok(event) = rx.try_recv() {
            saw_status |= matches!(event, TaskEvent::Status { .. });
        }
        assert!(saw_status);
    }

    #[tokio::test]
    async fn test_step_limit() {
        let session = echo_session();
        let llm = MockLlmClient::new()
            .then_command("echo 1")
            .then_command("echo 2")
            .then_command("echo 3");
        let config = OrchestratorConfig {
            max_steps: 2,
            ..Default::default()
        };
        let orch = TaskOrchestrator::new(Arc::new(llm), session.clone(), config)
            .with_detector(CompletionDetector::new(session.clone()).with_debounce(Duration::ZERO));
        let outcome = orch.run("count").await.unwrap();
        assert_eq!(outcome.reason, TaskEndReason::StepLimit);
        assert_eq!(session.sent_commands().len(), 2);
    }

    struct Decline;

    #[async_trait]
    impl CommandApproval for Decline {
        async fn approve(&self, _command: &str, _explanation: &str) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_declined_command_is_not_sent() {
        let session = echo_session();
        let llm = MockLlmClient::new().then_command("apt upgrade");
        let orch = TaskOrchestrator::new(Arc::new(llm), session.clone(), OrchestratorConfig::default())
            .with_approval(Arc::new(Decline));
        let outcome = orch.run("upgrade").await.unwrap();
        assert_eq!(outcome.reason, TaskEndReason::Declined("apt upgrade".to_string()));
        assert!(session.sent_commands().is_empty());
        assert!(orch.supervisor().pending_command().is_none());
    }

    #[tokio::test]
    async fn test_previous_task_is_in_context() {
        let session = echo_session();
        let llm = Arc::new(MockLlmClient::new().then_text("TASK_COMPLETE first").then_text("TASK_COMPLETE second"));
        let orch = TaskOrchestrator::new(llm.clone(), session, OrchestratorConfig::default());
        orch.run("first task").await.unwrap();
        orch.run("second task").await.unwrap();
        let second = &llm.requests()[1];
        assert!(second.messages.iter().any(|m| m.content == "first task"));
    }
}
