//! 轮询式命令执行（计划执行器使用）
//!
//! 每条命令后追加退出码标记请求，按固定间隔轮询输出，满足以下任一条件即认为完成：
//! - 看到退出码标记，且输出已稳定一次
//! - 尾部匹配到提示符，且输出已稳定一次
//! - 连续 N 次没有新写入，且命令相关的启发式成立（ls 含 total、ps 含 pid、其它命令有输出）
//! - 输出长时间无变化（卡死上限）：强制返回已有输出
//! 单条命令的超时只是建议性的：到点后返回已有输出，不会杀掉进程。

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::session::ansi::strip_ansi;
use crate::session::prompt::PromptMatcher;
use crate::session::SessionAdapter;

/// 退出码标记前缀
pub const EXIT_MARKER: &str = "__TP_EXIT:";
/// 追加在命令后的标记请求（\n 为字面量，由 printf 解释）
const EXIT_MARKER_REQUEST: &str = r"; printf '\n__TP_EXIT:%s\n' $?";
/// 未捕获到退出码时的取值
pub const UNKNOWN_EXIT_CODE: i32 = -1;

static EXIT_CODE_RE: OnceLock<Regex> = OnceLock::new();

fn exit_code_regex() -> &'static Regex {
    EXIT_CODE_RE.get_or_init(|| Regex::new(r"__TP_EXIT:(-?\d+)").unwrap())
}

/// 给命令加上退出码标记请求
pub fn with_exit_marker(command: &str) -> String {
    let trimmed = command.trim_end().trim_end_matches(';').trim_end();
    format!("{trimmed}{EXIT_MARKER_REQUEST}")
}

/// 拆出原始命令；第二个值表示是否带有标记请求
pub fn split_exit_marker(line: &str) -> (&str, bool) {
    match line.strip_suffix(EXIT_MARKER_REQUEST) {
        Some(command) => (command, true),
        None => (line, false),
    }
}

/// 单引号包裹，内部的单引号转义为 '\''
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// printf 实际输出的标记行
pub fn exit_marker_line(code: i32) -> String {
    format!("\n{EXIT_MARKER}{code}\n")
}

/// 取输出中最后一个退出码标记
pub fn parse_exit_code(output: &str) -> Option<i32> {
    exit_code_regex()
        .captures_iter(output)
        .last()
        .and_then(|c| c[1].parse().ok())
}

/// 轮询参数
#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub poll_interval: Duration,
    /// 启发式完成所需的连续稳定次数
    pub stable_checks: u32,
    /// 输出无变化多久视为卡死
    pub stuck_timeout: Duration,
    /// 每条命令前清空会话缓冲
    pub clear_between_commands: bool,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            stable_checks: 3,
            stuck_timeout: Duration::from_secs(10),
            clear_between_commands: true,
        }
    }
}

/// 完成判定的依据
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    ExitMarker,
    Prompt,
    Heuristic,
    /// 卡死上限触发，强制返回
    Stuck,
    /// 单条命令超时，强制返回
    TimedOut,
}

/// 一条命令的执行结果
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    pub output: String,
    pub exit_code: i32,
    pub completion: CompletionKind,
    pub duration: Duration,
}

impl CommandOutcome {
    pub fn forced(&self) -> bool {
        matches!(self.completion, CompletionKind::Stuck | CompletionKind::TimedOut)
    }
}

/// 命令相关的完成启发式
fn heuristic_satisfied(command: &str, output: &str) -> bool {
    let lower = output.to_lowercase();
    match command.split_whitespace().next().unwrap_or("") {
        "ls" if command.contains("-l") => lower.contains("total"),
        "ps" => lower.contains("pid"),
        _ => !output.trim().is_empty(),
    }
}

/// 清理输出：截掉尾部提示符、去掉所有带标记的行（包括回显的命令行）
fn clean_output(suffix: &str, matcher: &PromptMatcher) -> String {
    let body = match matcher.find(suffix) {
        Some(found) => &suffix[..found.start],
        None => suffix,
    };
    body.lines()
        .filter(|line| !line.contains(EXIT_MARKER))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// 轮询式命令执行器
pub struct CommandRunner {
    session: Arc<dyn SessionAdapter>,
    config: PollingConfig,
}

impl CommandRunner {
    pub fn new(session: Arc<dyn SessionAdapter>, config: PollingConfig) -> Self {
        Self { session, config }
    }

    pub fn session(&self) -> &Arc<dyn SessionAdapter> {
        &self.session
    }

    /// 执行一条命令并等待完成；timeout 为建议性上限
    pub async fn run(
        &self,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome, AgentError> {
        if self.config.clear_between_commands {
            self.session.clear();
        }
        let matcher = PromptMatcher::for_session(self.session.is_local_session());
        let mark = self.session.output_mark();
        let started = Instant::now();

        tracing::debug!(command = %command, "running command");
        self.session
            .send(&format!("{}\n", with_exit_marker(command)))
            .await?;

        let mut last_mark = mark;
        let mut last_change = Instant::now();
        let mut stable = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            let current = self.session.output_mark();
            let stripped = strip_ansi(&self.session.output_since(mark));
            let suffix = stripped.as_str();

            if current != last_mark {
                last_mark = current;
                last_change = Instant::now();
                stable = 0;
            } else {
                stable += 1;
            }

            let exit_code = parse_exit_code(suffix);
            let completion = if stable >= 1 && exit_code.is_some() {
                Some(CompletionKind::ExitMarker)
            } else if stable >= 1 && matcher.find(suffix).is_some() {
                Some(CompletionKind::Prompt)
            } else if stable >= self.config.stable_checks
                && heuristic_satisfied(command, &clean_output(suffix, &matcher))
            {
                Some(CompletionKind::Heuristic)
            } else if last_change.elapsed() >= self.config.stuck_timeout {
                Some(CompletionKind::Stuck)
            } else if started.elapsed() >= timeout {
                Some(CompletionKind::TimedOut)
            } else {
                None
            };

            if let Some(completion) = completion {
                let outcome = CommandOutcome {
                    output: clean_output(suffix, &matcher),
                    exit_code: exit_code.unwrap_or(UNKNOWN_EXIT_CODE),
                    completion,
                    duration: started.elapsed(),
                };
                if outcome.forced() {
                    tracing::warn!(
                        command = %command,
                        completion = ?completion,
                        "command did not finish cleanly, returning partial output"
                    );
                } else {
                    tracing::debug!(command = %command, exit_code = outcome.exit_code, completion = ?completion, "command finished");
                }
                return Ok(outcome);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MockReply, MockSession};

    fn fast_config() -> PollingConfig {
        PollingConfig {
            poll_interval: Duration::from_millis(10),
            stable_checks: 3,
            stuck_timeout: Duration::from_millis(300),
            clear_between_commands: true,
        }
    }

    #[test]
    fn test_marker_roundtrip_through_line() {
        let line = with_exit_marker("ls -la;");
        assert_eq!(split_exit_marker(&line), ("ls -la", true));
        assert_eq!(split_exit_marker("pwd"), ("pwd", false));
    }

    #[test]
    fn test_parse_exit_code_ignores_echoed_request() {
        let out = format!("{}\nfile{}", with_exit_marker("ls"), exit_marker_line(2));
        assert_eq!(parse_exit_code(&out), Some(2));
        assert_eq!(parse_exit_code(&with_exit_marker("ls")), None);
    }

    #[test]
    fn test_clean_output_removes_marker_lines_and_prompt() {
        let matcher = PromptMatcher::for_session(false);
        let suffix = format!(
            "{}\nhello{}user@host:~$ ",
            with_exit_marker("echo hello"),
            exit_marker_line(0)
        );
        assert_eq!(clean_output(&suffix, &matcher), "hello");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_heuristics() {
        assert!(heuristic_satisfied("ls -l", "total 8\n-rw-r--r-- a"));
        assert!(!heuristic_satisfied("ls -l", "-rw-r--r-- a"));
        assert!(heuristic_satisfied("ps aux", "USER PID %CPU"));
        assert!(heuristic_satisfied("uname", "Linux"));
        assert!(!heuristic_satisfied("uname", "  "));
    }

    #[tokio::test]
    async fn test_run_captures_output_and_exit_code() {
        let session = Arc::new(MockSession::new(|cmd: &str| {
            if cmd == "false" {
                MockReply::fail("", 1)
            } else {
                MockReply::ok("hello")
            }
        }));
        let runner = CommandRunner::new(session.clone(), fast_config());
        let cancel = CancellationToken::new();

        let ok = runner.run("echo hello", Duration::from_secs(5), &cancel).await.unwrap();
        assert_eq!(ok.output, "hello");
        assert_eq!(ok.exit_code, 0);
        assert_eq!(ok.completion, CompletionKind::ExitMarker);

        let failed = runner.run("false", Duration::from_secs(5), &cancel).await.unwrap();
        assert_eq!(failed.output, "");
        assert_eq!(failed.exit_code, 1);
        assert_eq!(session.sent_commands(), vec!["echo hello", "false"]);
    }

    #[tokio::test]
    async fn test_run_with_full_buffer_and_no_clear() {
        let session = Arc::new(MockSession::new(|_: &str| MockReply::ok("done")).with_output_cap(128));
        session.emit(&"y".repeat(200));
        let mut config = fast_config();
        config.clear_between_commands = false;
        let runner = CommandRunner::new(session.clone(), config);

        let outcome = runner
            .run("make install", Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.output, "done");
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.completion, CompletionKind::ExitMarker);
        assert_eq!(session.buffer().len(), 128);
    }

    #[tokio::test]
    async fn test_run_stuck_command_force_returns() {
        let session = Arc::new(MockSession::new(|_: &str| MockReply::hang()));
        let runner = CommandRunner::new(session, fast_config());
        let cancel = CancellationToken::new();

        let outcome = runner.run("tail -f log", Duration::from_secs(60), &cancel).await.unwrap();
        assert_eq!(outcome.completion, CompletionKind::Stuck);
        assert_eq!(outcome.exit_code, UNKNOWN_EXIT_CODE);
        assert!(outcome.forced());
    }

    #[tokio::test]
    async fn test_run_advisory_timeout() {
        let session = Arc::new(MockSession::new(|_: &str| MockReply::hang()));
        let mut config = fast_config();
        config.stuck_timeout = Duration::from_secs(60);
        let runner = CommandRunner::new(session, config);
        let cancel = CancellationToken::new();

        let outcome = runner.run("sleep 999", Duration::from_millis(100), &cancel).await.unwrap();
        assert_eq!(outcome.completion, CompletionKind::TimedOut);
    }

    #[tokio::test]
    async fn test_run_respects_cancellation() {
        let session = Arc::new(MockSession::new(|_: &str| MockReply::hang()));
        let runner = CommandRunner::new(session, fast_config());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = runner.run("sleep 1", Duration::from_secs(1), &cancel).await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }
}
