//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按脚本依次返回预设响应；脚本耗尽后回复完成短语，保证编排循环总能结束。
//! 同时记录收到的每个请求，便于断言 prompt 内容。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{ChatRequest, ChatResponse, LlmClient, LlmError};
use crate::tools::EXECUTE_TERMINAL_COMMAND;

/// 脚本化的 Mock 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<ChatResponse, LlmError>>>,
    requests: Mutex<Vec<ChatRequest>>,
    exhausted_reply: Option<String>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个调用 execute_terminal_command 的回复
    pub fn then_command(self, command: &str) -> Self {
        let args = serde_json::json!({ "command": command }).to_string();
        self.then(Ok(ChatResponse::from_tool_call(EXECUTE_TERMINAL_COMMAND, args)))
    }

    /// 追加一个纯文本回复
    pub fn then_text(self, text: &str) -> Self {
        self.then(Ok(ChatResponse::from_text(text)))
    }

    pub fn then_error(self, error: LlmError) -> Self {
        self.then(Err(error))
    }

    pub fn then(self, reply: Result<ChatResponse, LlmError>) -> Self {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(reply);
        self
    }

    /// 脚本耗尽后的回复文本（默认 "TASK_COMPLETE"）
    pub fn when_exhausted(mut self, text: &str) -> Self {
        self.exhausted_reply = Some(text.to_string());
        self
    }

    /// 已收到的请求
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);
        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        next.unwrap_or_else(|| {
            Ok(ChatResponse::from_text(
                self.exhausted_reply.as_deref().unwrap_or("TASK_COMPLETE"),
            ))
        })
    }
}
