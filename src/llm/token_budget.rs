//! Token 预算限流（每 60 秒窗口）
//!
//! 请求前按请求字节估算 token 并 acquire：窗口内 used + tokens ≤ limit 立即放行；否则睡到窗口结束，
//! 强制翻转窗口后放行。响应返回后再用 record 计入实际（或估算的）消耗。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// 窗口长度
pub const BUDGET_WINDOW: Duration = Duration::from_secs(60);

/// Token 估算器：按字节数 / 4 近似，至少 1
pub struct TokenEstimator;

impl TokenEstimator {
    pub fn estimate(text: &str) -> u64 {
        (text.len() as u64 / 4).max(1)
    }

    pub fn estimate_bytes(len: usize) -> u64 {
        (len as u64 / 4).max(1)
    }
}

/// 准入判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// 需等到该时刻（窗口结束）再强制放行
    WaitUntil(Instant),
}

/// 窗口状态（纯数据，时间由调用方传入）
#[derive(Debug, Clone)]
pub struct BudgetState {
    pub window_start: Instant,
    pub used_tokens: u64,
    pub limit: u64,
}

impl BudgetState {
    pub fn new(now: Instant, limit: u64) -> Self {
        Self {
            window_start: now,
            used_tokens: 0,
            limit: limit.max(1),
        }
    }

    fn window_end(&self) -> Instant {
        self.window_start + BUDGET_WINDOW
    }

    fn roll(&mut self, now: Instant) {
        self.window_start = now;
        self.used_tokens = 0;
    }

    /// 尝试准入；窗口已过期则先翻转。空窗口总是放行（单个超大请求不至于永远等待）
    pub fn try_admit(&mut self, now: Instant, tokens: u64) -> Admission {
        if now >= self.window_end() {
            self.roll(now);
        }
        if self.used_tokens == 0 || self.used_tokens + tokens <= self.limit {
            self.used_tokens += tokens;
            Admission::Admitted
        } else {
            Admission::WaitUntil(self.window_end())
        }
    }

    /// 等待结束后强制翻转并放行
    pub fn force_admit(&mut self, now: Instant, tokens: u64) {
        self.roll(now);
        self.used_tokens = tokens;
    }

    /// 计入事后消耗（响应 token）
    pub fn record(&mut self, now: Instant, tokens: u64) {
        if now >= self.window_end() {
            self.roll(now);
        }
        self.used_tokens += tokens;
    }
}

/// 进程级共享的 token 预算限流器
#[derive(Debug)]
pub struct TokenBudgetLimiter {
    state: Mutex<BudgetState>,
}

impl TokenBudgetLimiter {
    pub fn new(tokens_per_minute: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BudgetState::new(Instant::now(), tokens_per_minute)),
        })
    }

    /// 为 tokens 申请额度，返回实际等待时长
    pub async fn acquire(&self, tokens: u64) -> Duration {
        let started = Instant::now();
        loop {
            let admission = self.state.lock().await.try_admit(Instant::now(), tokens);
            match admission {
                Admission::Admitted => return started.elapsed(),
                Admission::WaitUntil(deadline) => {
                    tracing::info!(
                        tokens,
                        wait_ms = deadline.saturating_duration_since(Instant::now()).as_millis() as u64,
                        "token budget exhausted, waiting for window rollover"
                    );
                    tokio::time::sleep_until(deadline).await;
                    let mut state = self.state.lock().await;
                    // 其它等待者可能已先翻转窗口，此时回到正常判定
                    if state.window_start < deadline {
                        state.force_admit(Instant::now(), tokens);
                        return started.elapsed();
                    }
                }
            }
        }
    }

    pub async fn record(&self, tokens: u64) {
        self.state.lock().await.record(Instant::now(), tokens);
    }

    pub async fn used(&self) -> u64 {
        self.state.lock().await.used_tokens
    }
}
