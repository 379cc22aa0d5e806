//! 事件驱动的命令完成检测
//!
//! 发送前记录会话的累计写入位置；每次收到输出变化事件（以及开始时立即一次）取该位置之后的新增输出、
//! 去 ANSI 并按序匹配提示符尾部。写入位置单调递增，缓冲封顶截断或被清空都不影响新增部分的定位。第一次命中时，提示符之前的内容即命令输出。
//! 突发事件在 debounce 窗口内合并为一次检查。主路径没有固定超时，由外层调用方决定。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::session::ansi::strip_ansi;
use crate::session::prompt::{output_before, PromptMatcher};
use crate::session::{OutputSubscription, SessionAdapter};

/// 输出为空时的替代文本
pub const EMPTY_OUTPUT_SENTINEL: &str = "Command executed successfully";

/// 默认事件合并窗口
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(80);

/// 单次等待的完成信号：CAS 保证只有一个写入者成功
pub struct CompletionSignal {
    fired: AtomicBool,
    tx: Mutex<Option<oneshot::Sender<String>>>,
}

impl CompletionSignal {
    pub fn new() -> (Self, oneshot::Receiver<String>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                fired: AtomicBool::new(false),
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// 第一个调用者返回 true 并送出结果，其余调用一律返回 false
    pub fn resolve(&self, value: String) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tx) = tx {
            let _ = tx.send(value);
        }
        true
    }

    pub fn is_resolved(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// 在发送后新增的（已清洗）输出中检查提示符；命中则返回命令输出
pub fn extract_completed_output(suffix: &str, matcher: &PromptMatcher) -> Option<String> {
    let found = matcher.find(suffix)?;
    let output = output_before(suffix, &found);
    if output.is_empty() {
        Some(EMPTY_OUTPUT_SENTINEL.to_string())
    } else {
        Some(output)
    }
}

/// 一次进行中的等待
pub struct PendingCompletion {
    matcher: PromptMatcher,
    signal: CompletionSignal,
}

impl PendingCompletion {
    pub fn new(matcher: PromptMatcher) -> (Self, oneshot::Receiver<String>) {
        let (signal, rx) = CompletionSignal::new();
        (
            Self {
                matcher,
                signal,
            },
            rx,
        )
    }

    /// 用发送后新增的原始输出尝试完成；可从多个并发事件调用，至多一次返回 true
    pub fn offer(&self, raw_suffix: &str) -> bool {
        if self.signal.is_resolved() {
            return false;
        }
        let stripped = strip_ansi(raw_suffix);
        match extract_completed_output(&stripped, &self.matcher) {
            Some(output) => self.signal.resolve(output),
            None => false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.signal.is_resolved()
    }
}

/// 去掉输出开头回显的命令行（终端回显的就是刚发送的命令）
pub fn strip_command_echo(output: &str, command: &str) -> String {
    let command = command.trim();
    let mut lines = output.lines();
    let rest = match lines.next() {
        Some(first) if first.trim() == command => lines.collect::<Vec<_>>().join("\n"),
        _ => return output.to_string(),
    };
    let rest = rest.trim();
    if rest.is_empty() {
        EMPTY_OUTPUT_SENTINEL.to_string()
    } else {
        rest.to_string()
    }
}

/// 事件驱动的完成检测器：每个会话同一时刻只允许一个等待
pub struct CompletionDetector {
    session: Arc<dyn SessionAdapter>,
    debounce: Duration,
    in_flight: AtomicBool,
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl CompletionDetector {
    pub fn new(session: Arc<dyn SessionAdapter>) -> Self {
        Self {
            session,
            debounce: DEFAULT_DEBOUNCE,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn session(&self) -> &Arc<dyn SessionAdapter> {
        &self.session
    }

    pub fn is_waiting(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    fn begin(&self) -> Result<InFlightGuard<'_>, AgentError> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| AgentError::CompletionPending)?;
        Ok(InFlightGuard(&self.in_flight))
    }

    /// 发送命令并等待其完成，返回提示符之前的新增输出（已去 ANSI）
    pub async fn execute(
        &self,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        let _guard = self.begin()?;
        let mark = self.session.output_mark();

        // 先订阅再发送，避免丢失紧随其后的输出事件
        let mut subscription = self.session.subscribe();
        tracing::debug!(command = %command, mark, "sending command");
        if let Err(e) = self.session.send(&format!("{command}\n")).await {
            subscription.unsubscribe();
            return Err(e);
        }

        let result = self.wait(mark, &mut subscription, cancel).await;
        subscription.unsubscribe();
        result
    }

    async fn wait(
        &self,
        mark: u64,
        subscription: &mut OutputSubscription,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        let matcher = PromptMatcher::for_session(self.session.is_local_session());
        let (pending, mut rx) = PendingCompletion::new(matcher);

        pending.offer(&self.session.output_since(mark));

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("completion wait cancelled");
                    return Err(AgentError::Cancelled);
                }
                value = &mut rx => {
                    return value.map_err(|_| AgentError::Session("completion signal dropped".to_string()));
                }
                changed = subscription.changed() => {
                    if !changed {
                        return Err(AgentError::Session("session output stream closed".to_string()));
                    }
                    if !self.debounce.is_zero() {
                        tokio::time::sleep(self.debounce).await;
                    }
                    let coalesced = subscription.drain();
                    if coalesced > 0 {
                        tracing::debug!(coalesced, "coalesced output events");
                    }
                    pending.offer(&self.session.output_since(mark));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MockReply, MockSession};
    use futures_util::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    #[test]
    fn test_extract_completed_output() {
        let matcher = PromptMatcher::for_session(false);
        let out = extract_completed_output("ls\nfile1\nfile2\nuser@host:~$ ", &matcher).unwrap();
        assert_eq!(out, "ls\nfile1\nfile2");
    }

    #[test]
    fn test_extract_waits_for_prompt() {
        let matcher = PromptMatcher::for_session(false);
        assert!(extract_completed_output("sleep 5\n", &matcher).is_none());
    }

    #[test]
    fn test_extract_empty_output_uses_sentinel() {
        let matcher = PromptMatcher::for_session(false);
        let out = extract_completed_output("user@host:~$ ", &matcher).unwrap();
        assert_eq!(out, EMPTY_OUTPUT_SENTINEL);
    }

    #[test]
    fn test_strip_command_echo() {
        assert_eq!(strip_command_echo("ls -la\nfile", "ls -la"), "file");
        assert_eq!(strip_command_echo("cd /tmp", "cd /tmp"), EMPTY_OUTPUT_SENTINEL);
        assert_eq!(strip_command_echo("file", "ls"), "file");
    }

    #[tokio::test]
    async fn test_concurrent_offers_resolve_once() {
        let matcher = PromptMatcher::for_session(false);
        let (pending, rx) = PendingCompletion::new(matcher);
        let pending = Arc::new(pending);
        let snapshot = "\x1B[32mdone\x1B[0m\nuser@host:~$ ".to_string();

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let pending = pending.clone();
                let snapshot = snapshot.clone();
                tokio::spawn(async move { pending.offer(&snapshot) })
            })
            .collect();
        let wins = join_all(handles)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(true)))
            .count();

        assert_eq!(wins, 1);
        assert_eq!(rx.await.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_execute_returns_output_and_unsubscribes() {
        let session = Arc::new(MockSession::new(|cmd: &str| {
            MockReply::ok(format!("\x1B[1mran {cmd}\x1B[0m"))
        }));
        let detector = CompletionDetector::new(session.clone()).with_debounce(Duration::from_millis(5));
        let cancel = CancellationToken::new();

        let out = detector.execute("whoami", &cancel).await.unwrap();
        assert_eq!(out, "whoami\nran whoami");
        assert!(!out.contains('\x1B'));
        assert_eq!(session.buffer().subscriber_count(), 0);
        assert!(!detector.is_waiting());
    }

    #[tokio::test]
    async fn test_execute_cancel_leaves_session_untouched() {
        let session = Arc::new(
            MockSession::new(|_: &str| MockReply::ok("late")).with_delay(Duration::from_secs(30)),
        );
        let detector = CompletionDetector::new(session.clone());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = detector.execute("sleep 100", &cancel).await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        assert_eq!(session.buffer().subscriber_count(), 0);
        assert_eq!(session.sent_commands(), vec!["sleep 100".to_string()]);
    }

    #[tokio::test]
    async fn test_execute_after_buffer_reached_cap() {
        let session = Arc::new(
            MockSession::new(|_: &str| MockReply::ok("hello")).with_output_cap(256),
        );
        session.emit(&"x".repeat(300));
        session.emit("\nuser@host:~$ ");
        assert_eq!(session.buffer().len(), 256);
        let detector = CompletionDetector::new(session.clone()).with_debounce(Duration::from_millis(5));

        let out = tokio::time::timeout(
            Duration::from_secs(3),
            detector.execute("echo hello", &CancellationToken::new()),
        )
        .await
        .expect("detector must resolve once the prompt returns")
        .unwrap();
        assert_eq!(strip_command_echo(&out, "echo hello"), "hello");
        assert_eq!(session.buffer().len(), 256);
    }

    /// 统计读取新增输出的次数
    struct CountingSession {
        inner: Arc<MockSession>,
        reads: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl SessionAdapter for CountingSession {
        async fn send(&self, text: &str) -> Result<(), AgentError> {
            self.inner.send(text).await
        }

        fn current_output(&self) -> String {
            self.inner.current_output()
        }

        fn clear(&self) {
            self.inner.clear();
        }

        fn output_mark(&self) -> u64 {
            self.inner.output_mark()
        }

        fn output_since(&self, mark: u64) -> String {
            self.reads.fetch_add(1, AtomicOrdering::SeqCst);
            self.inner.output_since(mark)
        }

        fn subscribe(&self) -> OutputSubscription {
            self.inner.subscribe()
        }

        fn is_local_session(&self) -> bool {
            self.inner.is_local_session()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_burst_is_coalesced_into_one_check() {
        let inner = Arc::new(MockSession::new(|_: &str| MockReply::hang()).without_echo());
        let session = Arc::new(CountingSession {
            inner: inner.clone(),
            reads: AtomicUsize::new(0),
        });
        let detector = Arc::new(CompletionDetector::new(session.clone()).with_debounce(Duration::from_millis(80)));

        let waiting = {
            let detector = detector.clone();
            tokio::spawn(async move { detector.execute("make", &CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.reads.load(AtomicOrdering::SeqCst), 1);

        for i in 0..5 {
            inner.emit(&format!("line {i}\n"));
        }
        inner.emit("user@host:~$ ");

        let out = waiting.await.unwrap().unwrap();
        assert_eq!(out, "line 0\nline 1\nline 2\nline 3\nline 4");
        // 一次立即检查 + 突发合并后的一次检查
        assert_eq!(session.reads.load(AtomicOrdering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_wait_is_rejected() {
        let session = Arc::new(
            MockSession::new(|_: &str| MockReply::ok("x")).with_delay(Duration::from_millis(200)),
        );
        let detector = Arc::new(CompletionDetector::new(session));
        let cancel = CancellationToken::new();

        let first = {
            let detector = detector.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { detector.execute("one", &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = detector.execute("two", &cancel).await;
        assert!(matches!(second, Err(AgentError::CompletionPending)));
        assert!(first.await.unwrap().is_ok());
    }
}
