//! 执行历史：对话式任务中已完成命令的只追加记录
//!
//! 每条 ExecutionStep 在命令完成后创建、追加，之后不再修改；生命周期等于当前任务。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 单条已执行命令的不可变记录
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStep {
    pub step_number: usize,
    pub command: String,
    pub explanation: String,
    pub output: String,
    pub timestamp: DateTime<Utc>,
}

/// 只追加的执行历史
#[derive(Clone, Debug, Default)]
pub struct ExecutionHistory {
    steps: Vec<ExecutionStep>,
}

/// 拼入 prompt 时单条输出的最大字符数
const OUTPUT_PROMPT_CHARS: usize = 1500;

impl ExecutionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一条记录，step_number 自动递增（从 1 开始），返回新记录
    pub fn record(
        &mut self,
        command: impl Into<String>,
        explanation: impl Into<String>,
        output: impl Into<String>,
    ) -> &ExecutionStep {
        let step = ExecutionStep {
            step_number: self.steps.len() + 1,
            command: command.into(),
            explanation: explanation.into(),
            output: output.into(),
            timestamp: Utc::now(),
        };
        self.steps.push(step);
        &self.steps[self.steps.len() - 1]
    }

    pub fn steps(&self) -> &[ExecutionStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn last(&self) -> Option<&ExecutionStep> {
        self.steps.last()
    }

    /// 最近 n 条命令（按时间顺序）
    pub fn last_commands(&self, n: usize) -> Vec<&str> {
        let start = self.steps.len().saturating_sub(n);
        self.steps[start..].iter().map(|s| s.command.as_str()).collect()
    }

    /// 构建供推理服务使用的历史片段
    pub fn to_prompt_section(&self) -> String {
        if self.steps.is_empty() {
            return String::new();
        }
        let mut s = String::from("## Commands executed so far\n");
        for step in &self.steps {
            let output: String = step.output.chars().take(OUTPUT_PROMPT_CHARS).collect();
            let ellipsis = if step.output.chars().count() > OUTPUT_PROMPT_CHARS {
                "..."
            } else {
                ""
            };
            s.push_str(&format!(
                "{}. $ {}\n{}{}\n\n",
                step.step_number, step.command, output, ellipsis
            ));
        }
        s
    }

    /// 任务结束时的摘要
    pub fn summary(&self) -> String {
        if self.steps.is_empty() {
            return "No commands were executed.".to_string();
        }
        let commands: Vec<String> = self
            .steps
            .iter()
            .map(|s| format!("{}. {}", s.step_number, s.command))
            .collect();
        format!(
            "Executed {} command(s):\n{}",
            self.steps.len(),
            commands.join("\n")
        )
    }
}
