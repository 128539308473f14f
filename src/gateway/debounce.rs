//! 输入防抖：按会话缓冲短时间内连续到达的输入，窗口静默后合并为一批
//!
//! 每次 push 都把该会话的计时器重置为完整窗口；到期后按到达顺序整批发出并清空缓冲。
//! 发出之后到达的输入开始新的缓冲，已发出的批次不会再被修改。不同会话互不影响。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// 一次合并输出
#[derive(Debug)]
pub struct Batch<T> {
    pub key: String,
    pub items: Vec<T>,
    pub first_arrival: Instant,
    pub flushed_at: Instant,
}

struct Buffer<T> {
    items: Vec<T>,
    first_arrival: Instant,
    /// 每次 push 递增；计时器只在代数一致时发出，防止与并发 push 竞争
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

type Buffers<T> = Arc<Mutex<HashMap<String, Buffer<T>>>>;

/// 按 key 防抖
pub struct Debouncer<T> {
    buffers: Buffers<T>,
    window: Duration,
    tx: mpsc::UnboundedSender<Batch<T>>,
}

impl<T> Clone for Debouncer<T> {
    fn clone(&self) -> Self {
        Self {
            buffers: Arc::clone(&self.buffers),
            window: self.window,
            tx: self.tx.clone(),
        }
    }
}

fn flush<T>(buffers: &Buffers<T>, tx: &mpsc::UnboundedSender<Batch<T>>, key: &str, generation: Option<u64>) -> bool {
    let buffer = {
        let mut map = buffers.lock();
        match map.get(key) {
            Some(b) if generation.map_or(true, |g| g == b.generation) => map.remove(key),
            _ => None,
        }
    };
    let Some(buffer) = buffer else {
        return false;
    };
    if let Some(timer) = buffer.timer {
        timer.abort();
    }
    let batch = Batch {
        key: key.to_string(),
        items: buffer.items,
        first_arrival: buffer.first_arrival,
        flushed_at: Instant::now(),
    };
    tracing::debug!(key = %key, items = batch.items.len(), "Debounce flush");
    if tx.send(batch).is_err() {
        tracing::warn!(key = %key, "Debounce receiver closed, batch dropped");
    }
    true
}

impl<T: Send + 'static> Debouncer<T> {
    pub fn new(window: Duration) -> (Self, mpsc::UnboundedReceiver<Batch<T>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                buffers: Arc::new(Mutex::new(HashMap::new())),
                window,
                tx,
            },
            rx,
        )
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// 追加输入并重置该 key 的计时器
    pub fn push(&self, key: &str, item: T) {
        let mut map = self.buffers.lock();
        let buffer = map.entry(key.to_string()).or_insert_with(|| Buffer {
            items: Vec::new(),
            first_arrival: Instant::now(),
            generation: 0,
            timer: None,
        });
        if let Some(previous) = buffer.timer.take() {
            previous.abort();
        }
        buffer.items.push(item);
        buffer.generation += 1;

        let generation = buffer.generation;
        let buffers = Arc::clone(&self.buffers);
        let tx = self.tx.clone();
        let owned_key = key.to_string();
        let window = self.window;
        buffer.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            flush(&buffers, &tx, &owned_key, Some(generation));
        }));
    }

    /// 缓冲中的条目数
    pub fn pending(&self, key: &str) -> usize {
        self.buffers.lock().get(key).map_or(0, |b| b.items.len())
    }

    /// 立即发出某个 key 的缓冲
    pub fn flush_now(&self, key: &str) -> bool {
        flush(&self.buffers, &self.tx, key, None)
    }

    /// 立即发出全部缓冲（关闭前调用）
    pub fn flush_all(&self) -> usize {
        let keys: Vec<String> = self.buffers.lock().keys().cloned().collect();
        keys.iter().filter(|k| self.flush_now(k)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn millis_since(start: Instant, at: Instant) -> u128 {
        at.duration_since(start).as_millis()
    }

    #[tokio::test(start_paused = true)]
    async fn test_inputs_within_window_flush_once() {
        let (debouncer, mut rx) = Debouncer::new(Duration::from_millis(800));
        let start = Instant::now();

        debouncer.push("conv", "a");
        tokio::time::sleep(Duration::from_millis(300)).await;
        debouncer.push("conv", "b");
        tokio::time::sleep(Duration::from_millis(300)).await;
        debouncer.push("conv", "c");
        assert_eq!(debouncer.pending("conv"), 3);

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.items, vec!["a", "b", "c"]);
        assert_eq!(millis_since(start, batch.flushed_at), 1400);
        assert_eq!(millis_since(start, batch.first_arrival), 0);
        assert_eq!(debouncer.pending("conv"), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_input_after_flush_starts_new_buffer() {
        let (debouncer, mut rx) = Debouncer::new(Duration::from_millis(800));
        let start = Instant::now();

        debouncer.push("conv", 1);
        let first = rx.recv().await.unwrap();
        assert_eq!(millis_since(start, first.flushed_at), 800);

        tokio::time::sleep_until(start + Duration::from_millis(1500)).await;
        debouncer.push("conv", 2);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.items, vec![2]);
        assert_eq!(first.items, vec![1]);
        assert_eq!(millis_since(start, second.flushed_at), 2300);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conversations_are_independent() {
        let (debouncer, mut rx) = Debouncer::new(Duration::from_millis(800));
        debouncer.push("a", "a1");
        tokio::time::sleep(Duration::from_millis(500)).await;
        debouncer.push("b", "b1");

        let first = rx.recv().await.unwrap();
        assert_eq!(first.key, "a");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.key, "b");
        assert_eq!(second.items, vec!["b1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_all() {
        let (debouncer, mut rx) = Debouncer::new(Duration::from_secs(60));
        debouncer.push("a", 1);
        debouncer.push("b", 2);
        assert_eq!(debouncer.flush_all(), 2);
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        assert_eq!(debouncer.pending("a"), 0);
    }
}
