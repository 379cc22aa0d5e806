//! 会话监管：任务生命周期与协作式取消
//!
//! 会话持有根 CancellationToken；每个任务开始时派生子 token。停止任务时取消子 token
//! （结束正在进行的完成等待）并清空待确认命令，但不碰会话本身，底层进程照常存活。

use std::sync::{Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct TaskState {
    token: Option<CancellationToken>,
    /// 已提出、等待确认的命令
    pending_command: Option<String>,
}

/// 会话级生命周期管理
#[derive(Debug)]
pub struct SessionSupervisor {
    /// 会话关闭时触发
    cancel_token: CancellationToken,
    task: Mutex<TaskState>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            task: Mutex::new(TaskState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, TaskState> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 关闭整个会话（所有任务随之取消）
    pub fn cancel(&self) {
        self.cancel_token.cancel();
        self.state().pending_command = None;
    }

    /// 开始新任务，返回该任务的取消 token；上一个未结束的任务先被取消
    pub fn begin_task(&self) -> CancellationToken {
        let token = self.cancel_token.child_token();
        let mut state = self.state();
        if let Some(previous) = state.token.replace(token.clone()) {
            previous.cancel();
        }
        state.pending_command = None;
        token
    }

    /// 停止当前任务：取消等待、清空待确认命令
    pub fn cancel_task(&self) {
        let mut state = self.state();
        if let Some(token) = state.token.take() {
            token.cancel();
            tracing::info!("task cancelled");
        }
        state.pending_command = None;
    }

    /// 任务正常结束
    pub fn finish_task(&self) {
        let mut state = self.state();
        state.token = None;
        state.pending_command = None;
    }

    pub fn is_task_running(&self) -> bool {
        self.state()
            .token
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }

    pub fn set_pending_command(&self, command: impl Into<String>) {
        self.state().pending_command = Some(command.into());
    }

    pub fn pending_command(&self) -> Option<String> {
        self.state().pending_command.clone()
    }

    pub fn take_pending_command(&self) -> Option<String> {
        self.state().pending_command.take()
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_task_clears_pending_and_cancels_token() {
        let supervisor = SessionSupervisor::new();
        let token = supervisor.begin_task();
        supervisor.set_pending_command("ls");
        assert!(supervisor.is_task_running());

        supervisor.cancel_task();
        assert!(token.is_cancelled());
        assert!(supervisor.pending_command().is_none());
        assert!(!supervisor.is_task_running());
        assert!(!supervisor.cancel_token().is_cancelled());
    }

    #[test]
    fn test_begin_task_cancels_previous() {
        let supervisor = SessionSupervisor::new();
        let first = supervisor.begin_task();
        let second = supervisor.begin_task();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
    }

    #[test]
    fn test_session_cancel_propagates_to_task() {
        let supervisor = SessionSupervisor::new();
        let token = supervisor.begin_task();
        supervisor.cancel();
        assert!(token.is_cancelled());
    }
}
