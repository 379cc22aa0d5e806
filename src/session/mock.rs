//! Mock 会话（用于测试，无需真实终端）
//!
//! 行为接近交互式 Shell：立即回显收到的命令行，延迟一段时间后写入脚本化的输出、
//! 退出码标记（若命令带有标记请求）与新的提示符。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::core::AgentError;
use crate::session::buffer::{SessionBuffer, DEFAULT_OUTPUT_CAP};
use crate::session::runner::{exit_marker_line, split_exit_marker};
use crate::session::{OutputSubscription, SessionAdapter};

/// 脚本化回复：输出文本与退出码
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockReply {
    pub output: String,
    pub exit_code: i32,
    /// 为 true 时既不输出也不返回提示符
    pub hang: bool,
}

impl MockReply {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            exit_code: 0,
            hang: false,
        }
    }

    pub fn fail(output: impl Into<String>, exit_code: i32) -> Self {
        Self {
            output: output.into(),
            exit_code,
            hang: false,
        }
    }

    /// 不产生任何输出也不返回提示符（模拟卡住的命令）
    pub fn hang() -> Self {
        Self {
            output: String::new(),
            exit_code: -1,
            hang: true,
        }
    }
}

type Handler = dyn Fn(&str) -> MockReply + Send + Sync;

/// 内存会话
pub struct MockSession {
    buffer: Arc<SessionBuffer>,
    handler: Arc<Handler>,
    local: bool,
    prompt: String,
    echo: bool,
    delay: Duration,
    sent: Mutex<Vec<String>>,
}

impl MockSession {
    /// 远程会话，提示符 `user@host:~$ `，回显开启
    pub fn new(handler: impl Fn(&str) -> MockReply + Send + Sync + 'static) -> Self {
        let prompt = "user@host:~$ ".to_string();
        let buffer = SessionBuffer::new(DEFAULT_OUTPUT_CAP);
        buffer.append(&prompt);
        Self {
            buffer,
            handler: Arc::new(handler),
            local: false,
            prompt,
            echo: true,
            delay: Duration::from_millis(5),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// 切换为本地会话（提示符 `alice@laptop ~ % `）
    pub fn local(self) -> Self {
        self.with_prompt("alice@laptop ~ % ").with_local(true)
    }

    fn with_local(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self.buffer.clear();
        self.buffer.append(&self.prompt);
        self
    }

    /// 替换为指定上限的缓冲（保留当前提示符）
    pub fn with_output_cap(mut self, cap: usize) -> Self {
        self.buffer = SessionBuffer::new(cap);
        self.buffer.append(&self.prompt);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn without_echo(mut self) -> Self {
        self.echo = false;
        self
    }

    pub fn buffer(&self) -> &Arc<SessionBuffer> {
        &self.buffer
    }

    /// 直接写入原始输出（模拟异步到达的数据）
    pub fn emit(&self, text: &str) {
        self.buffer.append(text);
    }

    /// 已收到的命令（去掉退出码标记请求后的原始命令）
    pub fn sent_commands(&self) -> Vec<String> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl SessionAdapter for MockSession {
    async fn send(&self, text: &str) -> Result<(), AgentError> {
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            if self.echo {
                self.buffer.append(&format!("{line}\n"));
            }
            let (command, wants_marker) = split_exit_marker(line);
            let command = command.to_string();
            self.sent
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(command.clone());

            let buffer = self.buffer.clone();
            let handler = self.handler.clone();
            let prompt = self.prompt.clone();
            let delay = self.delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let reply = handler(&command);
                if reply.hang {
                    return;
                }
                let mut chunk = String::new();
                if !reply.output.is_empty() {
                    chunk.push_str(&reply.output);
                    if !reply.output.ends_with('\n') {
                        chunk.push('\n');
                    }
                }
                if wants_marker {
                    chunk.push_str(&exit_marker_line(reply.exit_code));
                }
                chunk.push_str(&prompt);
                buffer.append(&chunk);
            });
        }
        Ok(())
    }

    fn current_output(&self) -> String {
        self.buffer.snapshot()
    }

    fn clear(&self) {
        self.buffer.clear();
    }

    fn output_mark(&self) -> u64 {
        self.buffer.mark()
    }

    fn output_since(&self, mark: u64) -> String {
        self.buffer.since(mark)
    }

    fn subscribe(&self) -> OutputSubscription {
        self.buffer.subscribe()
    }

    fn is_local_session(&self) -> bool {
        self.local
    }
}
