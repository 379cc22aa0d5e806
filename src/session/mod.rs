//! 会话层：交互式 Shell 会话的适配契约与命令完成检测
//!
//! - **buffer**: 输出缓冲（封顶）与动态订阅
//! - **ansi**: ANSI 转义清洗
//! - **prompt**: 远程 / 本地两组提示符尾部正则
//! - **detector**: 事件驱动的完成检测（对话式任务使用）
//! - **runner**: 轮询式命令执行（计划执行器使用，带退出码捕获与卡死上限）
//! - **mock**: 脚本化的内存会话（测试用）
//!
//! 会话本身（PTY / SSH 进程的创建与管理）不在本 crate 内，由实现 SessionAdapter 的外部组件提供。

pub mod ansi;
pub mod buffer;
pub mod detector;
pub mod mock;
pub mod prompt;
pub mod runner;

use async_trait::async_trait;

use crate::core::AgentError;

pub use ansi::strip_ansi;
pub use buffer::{OutputSubscription, SessionBuffer, SubscriptionRegistry, DEFAULT_OUTPUT_CAP};
pub use detector::{
    strip_command_echo, CompletionDetector, CompletionSignal, PendingCompletion, EMPTY_OUTPUT_SENTINEL,
};
pub use mock::{MockReply, MockSession};
pub use prompt::{PromptMatch, PromptMatcher};
pub use runner::{CommandOutcome, CommandRunner, CompletionKind, PollingConfig};

/// 会话适配器契约：发送文本、读取累计输出、清空、订阅输出变化、会话类型
#[async_trait]
pub trait SessionAdapter: Send + Sync {
    /// 原样写入会话（调用方负责换行）
    async fn send(&self, text: &str) -> Result<(), AgentError>;

    /// 累计输出（有上限，超出部分丢弃最旧数据）
    fn current_output(&self) -> String;

    fn clear(&self);

    /// 累计写入位置（单调递增，clear 与封顶截断都不回退）
    fn output_mark(&self) -> u64;

    /// mark 之后写入、仍在缓冲中的原始输出
    fn output_since(&self, mark: u64) -> String;

    /// 订阅输出变化；句柄需显式 unsubscribe
    fn subscribe(&self) -> OutputSubscription;

    /// 本地会话与远程会话的提示符形态不同
    fn is_local_session(&self) -> bool;
}
