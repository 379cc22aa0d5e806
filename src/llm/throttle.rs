//! 并发 + 节奏节流
//!
//! 计数信号量限制同时在途的调用数（默认 1，即完全串行）；获取槽位后再保证距上一次调用开始
//! 至少 min_interval（不足则睡眠补齐）。获取信号量有上限等待（默认 8s），超时返回 None，
//! 调用方应视为软失败、无槽位继续，而不是死等。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// 节流参数
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    pub max_concurrent: usize,
    pub min_interval: Duration,
    pub acquire_timeout: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            min_interval: Duration::from_secs(2),
            acquire_timeout: Duration::from_secs(8),
        }
    }
}

/// 持有期间占用一个并发槽位；drop 即释放
#[derive(Debug)]
pub struct ThrottlePermit {
    _permit: OwnedSemaphorePermit,
}

/// 进程级共享：所有推理调用必须经过同一个实例
#[derive(Debug)]
pub struct Throttle {
    semaphore: Arc<Semaphore>,
    /// 下一次调用最早允许开始的时刻
    next_slot: Mutex<Option<Instant>>,
    config: ThrottleConfig,
}

impl Throttle {
    pub fn new(config: ThrottleConfig) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            next_slot: Mutex::new(None),
            config,
        })
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// 当前空闲槽位数
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// 获取槽位并补齐最小间隔；限时内拿不到槽位返回 None
    pub async fn acquire(&self) -> Option<ThrottlePermit> {
        let permit = match tokio::time::timeout(
            self.config.acquire_timeout,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return None,
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.config.acquire_timeout.as_millis() as u64,
                    "throttle slot not acquired in time, proceeding without it"
                );
                return None;
            }
        };
        self.pace().await;
        Some(ThrottlePermit { _permit: permit })
    }

    /// 预订下一个时间片后在锁外睡眠，避免多个等待者叠加同一段间隔
    async fn pace(&self) {
        let start_at = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let start_at = match *next {
                Some(slot) if slot > now => slot,
                _ => now,
            };
            *next = Some(start_at + self.config.min_interval);
            start_at
        };
        let now = Instant::now();
        if start_at > now {
            tracing::debug!(wait_ms = (start_at - now).as_millis() as u64, "pacing reasoning call");
            tokio::time::sleep_until(start_at).await;
        }
    }
}
