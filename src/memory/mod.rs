//! 记忆层：请求消息与跨任务上下文、对话式任务的执行历史（任务内）

pub mod conversation;
pub mod history;

pub use conversation::{Message, Role, TaskContext};
pub use history::{ExecutionHistory, ExecutionStep};
