//! 会话输出缓冲与动态订阅
//!
//! 缓冲内容与订阅者集合位于同一把锁之后（单一同步域），保证追加、清空、订阅与快照之间不会交错。
//! 订阅返回显式句柄 OutputSubscription，unsubscribe 幂等；检测器在等待结束（完成或取消）时立即退订，
//! 空闲时不产生任何唤醒。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc;

/// 默认缓冲上限（字节），超出后丢弃最旧的数据
pub const DEFAULT_OUTPUT_CAP: usize = 256 * 1024;

/// 可被订阅句柄回调退订的对象
pub trait SubscriptionRegistry: Send + Sync {
    fn unsubscribe(&self, id: u64);
}

/// 输出变化订阅句柄：每次有新输出时收到一个通知（不携带数据，调用方自行取快照）
pub struct OutputSubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<()>,
    registry: Weak<dyn SubscriptionRegistry>,
    active: AtomicBool,
}

impl OutputSubscription {
    pub fn new(id: u64, rx: mpsc::UnboundedReceiver<()>, registry: Weak<dyn SubscriptionRegistry>) -> Self {
        Self {
            id,
            rx,
            registry,
            active: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// 等待下一次输出变化；返回 false 表示已退订或事件源已关闭
    pub async fn changed(&mut self) -> bool {
        if !self.is_active() {
            return false;
        }
        self.rx.recv().await.is_some()
    }

    /// 取走已排队的通知（合并一次突发），返回合并的数量
    pub fn drain(&mut self) -> usize {
        let mut n = 0;
        while self.rx.try_recv().is_ok() {
            n += 1;
        }
        n
    }

    /// 退订；可重复调用
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            if let Some(registry) = self.registry.upgrade() {
                registry.unsubscribe(self.id);
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for OutputSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for OutputSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSubscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[derive(Default)]
struct BufferState {
    output: String,
    subscribers: HashMap<u64, mpsc::UnboundedSender<()>>,
    next_id: u64,
    /// 累计写入字节数，clear 与封顶截断都不回退
    written: u64,
}

/// 会话侧输出缓冲：追加、封顶、清空、快照、订阅
pub struct SessionBuffer {
    state: Mutex<BufferState>,
    cap: usize,
}

impl SessionBuffer {
    pub fn new(cap: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BufferState::default()),
            cap: cap.max(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        // 锁内不会 panic，中毒时沿用内部数据
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 追加一段输出并通知所有订阅者；已关闭的订阅者顺带清理
    pub fn append(&self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        let mut state = self.lock();
        state.output.push_str(chunk);
        state.written += chunk.len() as u64;
        if state.output.len() > self.cap {
            let mut cut = state.output.len() - self.cap;
            while !state.output.is_char_boundary(cut) {
                cut += 1;
            }
            state.output.drain(..cut);
        }
        state.subscribers.retain(|_, tx| tx.send(()).is_ok());
    }

    pub fn snapshot(&self) -> String {
        self.lock().output.clone()
    }

    /// 当前写入位置；配合 `since` 取之后新增的输出
    pub fn mark(&self) -> u64 {
        self.lock().written
    }

    /// mark 之后写入且仍保留在缓冲中的输出（被封顶丢弃或被 clear 的部分不再返回）
    pub fn since(&self, mark: u64) -> String {
        let state = self.lock();
        let added = usize::try_from(state.written.saturating_sub(mark)).unwrap_or(usize::MAX);
        let mut start = state.output.len().saturating_sub(added);
        while !state.output.is_char_boundary(start) {
            start += 1;
        }
        state.output[start..].to_string()
    }

    pub fn len(&self) -> usize {
        self.lock().output.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().output.is_empty()
    }

    pub fn clear(&self) {
        self.lock().output.clear();
    }

    /// 订阅输出变化
    pub fn subscribe(self: &Arc<Self>) -> OutputSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.subscribers.insert(id, tx);
            id
        };
        let registry: Arc<dyn SubscriptionRegistry> = self.clone();
        OutputSubscription::new(id, rx, Arc::downgrade(&registry))
    }

    /// 当前订阅者数量（用于确认等待结束后没有残留订阅）
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

impl SubscriptionRegistry for SessionBuffer {
    fn unsubscribe(&self, id: u64) {
        self.lock().subscribers.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cap_drops_oldest() {
        let buffer = SessionBuffer::new(8);
        buffer.append("0123456789");
        assert_eq!(buffer.snapshot(), "23456789");
        buffer.append("ab");
        assert_eq!(buffer.snapshot(), "456789ab");
    }

    #[test]
    fn test_cap_respects_char_boundary() {
        let buffer = SessionBuffer::new(4);
        buffer.append("é❯ab");
        let snap = buffer.snapshot();
        assert!(snap.len() <= 4);
        assert!(snap.ends_with("ab"));
    }

    #[tokio::test]
    async fn test_subscription_receives_and_unsubscribes() {
        let buffer = SessionBuffer::new(DEFAULT_OUTPUT_CAP);
        let mut sub = buffer.subscribe();
        assert_eq!(buffer.subscriber_count(), 1);

        buffer.append("a");
        buffer.append("b");
        assert!(sub.changed().await);
        assert_eq!(sub.drain(), 1);

        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(buffer.subscriber_count(), 0);
        assert!(!sub.changed().await);
    }

    #[test]
    fn test_drop_releases_subscription() {
        let buffer = SessionBuffer::new(DEFAULT_OUTPUT_CAP);
        {
            let _sub = buffer.subscribe();
            assert_eq!(buffer.subscriber_count(), 1);
        }
        assert_eq!(buffer.subscriber_count(), 0);
    }

    #[test]
    fn test_since_mark_survives_cap() {
        let buffer = SessionBuffer::new(16);
        buffer.append("0123456789abcdef");
        let mark = buffer.mark();
        buffer.append("XYZ");
        assert_eq!(buffer.len(), 16);
        assert_eq!(buffer.since(mark), "XYZ");
        assert_eq!(buffer.since(0), buffer.snapshot());
    }

    #[test]
    fn test_since_mark_after_clear() {
        let buffer = SessionBuffer::new(DEFAULT_OUTPUT_CAP);
        buffer.append("old output\n");
        let mark = buffer.mark();
        buffer.append("partial");
        buffer.clear();
        buffer.append("fresh");
        assert_eq!(buffer.since(mark), "fresh");
        assert_eq!(buffer.since(buffer.mark()), "");
    }

    #[test]
    fn test_clear() {
        let buffer = SessionBuffer::new(DEFAULT_OUTPUT_CAP);
        buffer.append("hello");
        buffer.clear();
        assert!(buffer.is_empty());
    }
}
