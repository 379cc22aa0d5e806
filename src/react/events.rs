//! 任务过程事件：用于向前端推送步数、思考、命令与输出

use serde::Serialize;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// 当前第几步
    StepUpdate { step: usize, max_steps: usize },
    /// 正在请求推理服务
    Thinking,
    /// 推理服务对命令的说明
    ThinkingContent { text: String },
    /// 提出的命令（等待确认或直接执行）
    CommandProposed { command: String, explanation: String },
    /// 被拒绝的命令（危险、参数非法、用户拒绝）
    CommandRejected { command: String, reason: String },
    /// 命令输出（预览）
    CommandOutput { command: String, preview: String },
    /// 面向用户的状态文案（服务不可用、配额耗尽等）
    Status { text: String },
    /// Token 使用统计（累计）
    TokenUsage {
        prompt_tokens: u64,
        completion_tokens: u64,
        total_tokens: u64,
    },
    /// 任务结束
    Completed { finished: bool, summary: String },
}
