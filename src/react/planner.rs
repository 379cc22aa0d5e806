//! Planner：向推理服务请求下一条命令，并解析回复
//!
//! 优先读取 execute_terminal_command 的 tool call；没有 tool call 时兼容正文里的
//! `{"command": "..."}` JSON；都没有则视为对用户的最终回复。

use std::sync::Arc;

use serde::Deserialize;

use crate::core::AgentError;
use crate::llm::{ChatRequest, ChatResponse, LlmClient, LlmError};
use crate::memory::{ExecutionHistory, Message};
use crate::tools::{execute_terminal_command_tool, ExecuteTerminalCommandArgs, EXECUTE_TERMINAL_COMMAND};

/// 任务完成短语（默认值，可在配置中覆盖）
pub const DEFAULT_COMPLETION_PHRASE: &str = "TASK_COMPLETE";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You operate an interactive shell session to accomplish the user's task. \
Issue exactly one command per reply by calling the execute_terminal_command tool, and explain briefly why in the message content. \
Inspect the output of each command before deciding the next one. Never repeat a command that already succeeded. \
Do not use destructive commands (rm -rf, mkfs, dd, shutdown, chmod 777). \
When the task is done, reply without a tool call and include TASK_COMPLETE followed by a short summary.";

/// 推理服务提出的命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposedCommand {
    pub command: String,
    pub explanation: String,
}

/// Planner 输出
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannerOutput {
    /// 需要执行命令
    Command(ProposedCommand),
    /// 直接回复用户（不再执行命令）
    Response(String),
}

/// 正文中兼容的 JSON 形态
#[derive(Deserialize)]
struct InlineCommand {
    command: String,
    #[serde(default)]
    explanation: String,
}

fn parse_arguments(arguments: &str) -> Result<String, AgentError> {
    let args: ExecuteTerminalCommandArgs = serde_json::from_str(arguments)
        .map_err(|e| AgentError::InvalidCommand(format!("{e}: {arguments}")))?;
    let command = args.command.trim();
    if command.is_empty() {
        return Err(AgentError::InvalidCommand("empty command".to_string()));
    }
    Ok(command.to_string())
}

/// 从正文中提取 JSON 对象（```json 代码块或第一个 { 到最后一个 }）
fn inline_command(content: &str) -> Option<InlineCommand> {
    let json = if let Some(start) = content.find("```json") {
        let rest = &content[start + 7..];
        rest.find("```").map(|end| &rest[..end]).unwrap_or(rest)
    } else {
        let start = content.find('{')?;
        let end = content.rfind('}')?;
        content.get(start..=end)?
    };
    serde_json::from_str::<InlineCommand>(json.trim())
        .ok()
        .filter(|c| !c.command.trim().is_empty())
}

/// 解析推理服务的回复
pub fn parse_response(response: &ChatResponse) -> Result<PlannerOutput, AgentError> {
    let message = response
        .first_message()
        .ok_or_else(|| LlmError::MalformedResponse("response has no choices".to_string()))?;
    let content = message.content.as_deref().unwrap_or("").trim();

    if let Some(calls) = message.tool_calls.as_ref().filter(|c| !c.is_empty()) {
        let call = calls
            .iter()
            .find(|c| c.function.name == EXECUTE_TERMINAL_COMMAND)
            .ok_or_else(|| AgentError::InvalidCommand(format!("unknown tool: {}", calls[0].function.name)))?;
        return Ok(PlannerOutput::Command(ProposedCommand {
            command: parse_arguments(&call.function.arguments)?,
            explanation: content.to_string(),
        }));
    }

    if content.is_empty() {
        return Err(LlmError::MalformedResponse("reply has neither content nor tool calls".to_string()).into());
    }
    match inline_command(content) {
        Some(inline) => Ok(PlannerOutput::Command(ProposedCommand {
            command: inline.command.trim().to_string(),
            explanation: inline.explanation,
        })),
        None => Ok(PlannerOutput::Response(content.to_string())),
    }
}

/// Planner：持有 LLM 与 system prompt
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, system_prompt: impl Into<String>) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
        }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// 获取 LLM 累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    /// 拼请求：system + 之前任务的对话 + 本任务（任务、已执行命令、上一轮的反馈）
    pub fn build_request(
        &self,
        context: &[Message],
        task: &str,
        history: &ExecutionHistory,
        feedback: &[String],
    ) -> ChatRequest {
        let mut user = format!("## Task\n{task}\n");
        let section = history.to_prompt_section();
        if !section.is_empty() {
            user.push('\n');
            user.push_str(&section);
        }
        if !feedback.is_empty() {
            user.push_str("\n## Notes\n");
            for note in feedback {
                user.push_str(&format!("- {note}\n"));
            }
        }
        let mut messages = Vec::with_capacity(context.len() + 2);
        messages.push(Message::system(self.system_prompt.clone()));
        messages.extend_from_slice(context);
        messages.push(Message::user(user));
        ChatRequest::new(messages)
            .with_tools(vec![execute_terminal_command_tool()])
    }

    /// 请求下一步
    pub async fn next(
        &self,
        context: &[Message],
        task: &str,
        history: &ExecutionHistory,
        feedback: &[String],
    ) -> Result<PlannerOutput, AgentError> {
        let request = self.build_request(context, task, history, feedback);
        let response = self.llm.chat(request).await?;
        parse_response(&response)
    }
}
