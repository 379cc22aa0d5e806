//! 跨任务上下文与请求消息
//!
//! `Message` 即请求体里的 `{role, content}`；`TaskContext` 记下同一会话里已结束任务的
//! （任务描述, 结果摘要），下一任务的请求把它们当作前置的 user/assistant 对发给推理服务。

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// 消息角色，序列化为小写
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 请求中的一条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

#[derive(Clone, Debug)]
struct CompletedTask {
    task: String,
    summary: String,
}

/// 最近若干个已结束任务，超出上限丢弃最旧的
#[derive(Clone, Debug)]
pub struct TaskContext {
    tasks: VecDeque<CompletedTask>,
    max_tasks: usize,
}

impl TaskContext {
    pub fn new(max_tasks: usize) -> Self {
        Self {
            tasks: VecDeque::with_capacity(max_tasks),
            max_tasks,
        }
    }

    /// 记录一个结束的任务及其摘要
    pub fn record(&mut self, task: impl Into<String>, summary: impl Into<String>) {
        if self.max_tasks == 0 {
            return;
        }
        while self.tasks.len() >= self.max_tasks {
            self.tasks.pop_front();
        }
        self.tasks.push_back(CompletedTask {
            task: task.into(),
            summary: summary.into(),
        });
    }

    /// 按时间顺序展开为 user(任务) / assistant(摘要) 消息对
    pub fn to_messages(&self) -> Vec<Message> {
        self.tasks
            .iter()
            .flat_map(|t| [Message::user(t.task.clone()), Message::assistant(t.summary.clone())])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oldest_task_is_dropped() {
        let mut context = TaskContext::new(2);
        context.record("list files", "3 files");
        context.record("check disk", "40% used");
        context.record("show uptime", "up 3 days");

        let messages = context.to_messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0], Message::user("check disk"));
        assert_eq!(messages[1], Message::assistant("40% used"));
        assert_eq!(messages[3], Message::assistant("up 3 days"));
    }

    #[test]
    fn test_zero_capacity_keeps_nothing() {
        let mut context = TaskContext::new(0);
        context.record("list files", "3 files");
        assert!(context.to_messages().is_empty());
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&Message::system("x")).unwrap();
        assert_eq!(json, r#"{"role":"system","content":"x"}"#);
    }
}
