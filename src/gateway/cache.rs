//! 幂等响应缓存：(会话 ID, 客户端请求 ID) → 进行中或已完成的结果
//!
//! 请求 ID 只在会话内唯一，不同会话复用同一 ID 互不影响。
//! begin(key) 在一次加锁内完成判断与占位：
//! - 不存在（或已过期）：建 PENDING，返回 Proceed(PendingGuard)，调用方负责执行
//! - PENDING：返回 InFlight，等待方通过 watch 通道拿到同一结果
//! - DONE / FAILED 且未过期：直接返回存储的结果
//!
//! 完成后保留 TTL（默认 5 分钟），由与流量无关的定时清扫移除。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::{ErrorKind, ErrorPayload, GatewayError};
use crate::observability::{EventBus, ObservabilityEvent};

/// 缓存的最终结果
pub type CachedOutcome = Result<String, ErrorPayload>;

/// 缓存键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub conversation_id: String,
    pub request_id: String,
}

impl CacheKey {
    pub fn new(conversation_id: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            request_id: request_id.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.conversation_id, self.request_id)
    }
}

/// 条目状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Pending,
    Done,
    Failed,
}

struct CacheEntry {
    state: CacheState,
    created_at: Instant,
    expires_at: Option<Instant>,
    tx: watch::Sender<Option<CachedOutcome>>,
}

fn abandoned() -> ErrorPayload {
    ErrorPayload {
        kind: ErrorKind::Cancelled,
        message: "The request was abandoned before it completed.".to_string(),
    }
}

/// 等待进行中的请求完成
pub struct CompletionWaiter {
    rx: watch::Receiver<Option<CachedOutcome>>,
}

impl CompletionWaiter {
    pub async fn wait(mut self) -> CachedOutcome {
        let outcome = match self.rx.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| Err(abandoned()))
    }
}

/// begin 的结果
pub enum Admission {
    /// 调用方拥有执行权
    Proceed(PendingGuard),
    InFlight(CompletionWaiter),
    Ready(CachedOutcome),
}

impl fmt::Debug for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Admission::Proceed(g) => write!(f, "Proceed({})", g.key),
            Admission::InFlight(_) => write!(f, "InFlight"),
            Admission::Ready(r) => write!(f, "Ready({:?})", r),
        }
    }
}

/// 执行权守卫：未完成就被丢弃时把条目标记为 FAILED（abandoned），等待方不会永远挂起
pub struct PendingGuard {
    cache: Arc<ResponseCache>,
    key: CacheKey,
    finished: bool,
}

impl PendingGuard {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn complete(mut self, result: String) -> Result<(), GatewayError> {
        self.finished = true;
        self.cache.complete(&self.key, result)
    }

    pub fn fail(mut self, error: &GatewayError) -> Result<(), GatewayError> {
        self.finished = true;
        self.cache.fail(&self.key, error)
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(key = %self.key, "Pending request dropped without completion");
            let _ = self.cache.finish(&self.key, Err(abandoned()));
        }
    }
}

/// 幂等响应缓存
pub struct ResponseCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    ttl: Duration,
    events: EventBus,
}

impl ResponseCache {
    pub fn new(ttl: Duration, events: EventBus) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            events,
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn begin(self: &Arc<Self>, key: &CacheKey) -> Admission {
        let now = Instant::now();
        let admission = {
            let mut entries = self.entries.lock();
            let expired = entries
                .get(key)
                .and_then(|e| e.expires_at)
                .map_or(false, |at| now >= at);
            if expired {
                entries.remove(key);
            }

            match entries.get(key) {
                Some(entry) => match entry.state {
                    CacheState::Pending => Admission::InFlight(CompletionWaiter {
                        rx: entry.tx.subscribe(),
                    }),
                    CacheState::Done | CacheState::Failed => {
                        let stored = entry.tx.borrow().clone();
                        Admission::Ready(stored.unwrap_or_else(|| Err(abandoned())))
                    }
                },
                None => {
                    let (tx, _rx) = watch::channel(None);
                    entries.insert(
                        key.clone(),
                        CacheEntry {
                            state: CacheState::Pending,
                            created_at: now,
                            expires_at: None,
                            tx,
                        },
                    );
                    Admission::Proceed(PendingGuard {
                        cache: Arc::clone(self),
                        key: key.clone(),
                        finished: false,
                    })
                }
            }
        };

        let conversation_id = key.conversation_id.clone();
        let request_id = key.request_id.clone();
        match &admission {
            Admission::Proceed(_) => self.events.emit(ObservabilityEvent::CacheMiss {
                conversation_id,
                request_id,
            }),
            _ => self.events.emit(ObservabilityEvent::CacheHit {
                conversation_id,
                request_id,
            }),
        }
        admission
    }

    /// PENDING → DONE；重复调用是约定破坏，记录后返回错误，不影响已存结果
    pub fn complete(&self, key: &CacheKey, result: String) -> Result<(), GatewayError> {
        self.finish(key, Ok(result))
    }

    /// PENDING → FAILED
    pub fn fail(&self, key: &CacheKey, error: &GatewayError) -> Result<(), GatewayError> {
        self.finish(key, Err(error.to_payload()))
    }

    fn finish(&self, key: &CacheKey, outcome: CachedOutcome) -> Result<(), GatewayError> {
        let now = Instant::now();
        let violation = {
            let mut entries = self.entries.lock();
            match entries.get_mut(key) {
                Some(entry) if entry.state == CacheState::Pending => {
                    entry.state = if outcome.is_ok() {
                        CacheState::Done
                    } else {
                        CacheState::Failed
                    };
                    entry.expires_at = Some(now + self.ttl);
                    tracing::debug!(
                        key = %key,
                        state = ?entry.state,
                        elapsed_ms = now.duration_since(entry.created_at).as_millis() as u64,
                        "Cache entry completed"
                    );
                    entry.tx.send_replace(Some(outcome));
                    None
                }
                Some(_) => Some(format!("request {} completed twice", key)),
                None => Some(format!("request {} is not pending in the cache", key)),
            }
        };

        match violation {
            None => Ok(()),
            Some(detail) => {
                self.events.emit(ObservabilityEvent::ContractViolation {
                    detail: detail.clone(),
                });
                Err(GatewayError::ContractViolation(detail))
            }
        }
    }

    pub fn state(&self, key: &CacheKey) -> Option<CacheState> {
        self.entries.lock().get(key).map(|e| e.state)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 移除在 now 之前过期的条目，返回移除数量
    pub fn sweep(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at.map_or(true, |at| now < at));
        before - entries.len()
    }

    /// 后台定时清扫，shutdown 后退出
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.sweep(Instant::now());
                        if removed > 0 {
                            tracing::debug!(removed, "Cache sweep");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> Arc<ResponseCache> {
        ResponseCache::new(Duration::from_secs(300), EventBus::default())
    }

    fn key(request_id: &str) -> CacheKey {
        CacheKey::new("conv", request_id)
    }

    fn expect_proceed(a: Admission) -> PendingGuard {
        match a {
            Admission::Proceed(g) => g,
            other => panic!("expected Proceed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_begin_complete_then_ready() {
        let cache = cache();
        let guard = expect_proceed(cache.begin(&key("r1")));
        assert_eq!(cache.state(&key("r1")), Some(CacheState::Pending));
        guard.complete("hello".into()).unwrap();
        match cache.begin(&key("r1")) {
            Admission::Ready(Ok(text)) => assert_eq!(text, "hello"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_in_flight_waiter_gets_result() {
        let cache = cache();
        let guard = expect_proceed(cache.begin(&key("r1")));
        let waiter = match cache.begin(&key("r1")) {
            Admission::InFlight(w) => w,
            other => panic!("unexpected {:?}", other),
        };
        let handle = tokio::spawn(waiter.wait());
        guard.fail(&GatewayError::Billing("x".into())).unwrap();
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.unwrap_err().kind, ErrorKind::Billing);
    }

    #[tokio::test]
    async fn test_same_request_id_in_other_conversation_is_separate() {
        let cache = cache();
        let alice = CacheKey::new("alice", "1");
        let bob = CacheKey::new("bob", "1");
        let guard = expect_proceed(cache.begin(&alice));
        let other = expect_proceed(cache.begin(&bob));
        guard.complete("for alice".into()).unwrap();
        other.complete("for bob".into()).unwrap();
        match cache.begin(&bob) {
            Admission::Ready(Ok(text)) => assert_eq!(text, "for bob"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_second_completion_is_contract_violation() {
        let cache = cache();
        let guard = expect_proceed(cache.begin(&key("r1")));
        guard.complete("first".into()).unwrap();
        let err = cache.complete(&key("r1"), "second".into()).unwrap_err();
        assert!(matches!(err, GatewayError::ContractViolation(_)));
        match cache.begin(&key("r1")) {
            Admission::Ready(Ok(text)) => assert_eq!(text, "first"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dropped_guard_fails_entry() {
        let cache = cache();
        let guard = expect_proceed(cache.begin(&key("r1")));
        let waiter = match cache.begin(&key("r1")) {
            Admission::InFlight(w) => w,
            other => panic!("unexpected {:?}", other),
        };
        drop(guard);
        assert_eq!(cache.state(&key("r1")), Some(CacheState::Failed));
        assert_eq!(waiter.wait().await.unwrap_err().kind, ErrorKind::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_after_ttl_and_sweep() {
        let cache = cache();
        expect_proceed(cache.begin(&key("r1"))).complete("v".into()).unwrap();

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(cache.sweep(Instant::now()), 0);
        assert!(matches!(cache.begin(&key("r1")), Admission::Ready(_)));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.sweep(Instant::now()), 1);
        assert!(cache.is_empty());
        assert!(matches!(cache.begin(&key("r1")), Admission::Proceed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_replaced_at_begin() {
        let cache = cache();
        expect_proceed(cache.begin(&key("r1"))).complete("old".into()).unwrap();
        tokio::time::advance(Duration::from_secs(301)).await;
        let guard = expect_proceed(cache.begin(&key("r1")));
        guard.complete("new".into()).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper_removes_expired() {
        let cache = cache();
        let shutdown = CancellationToken::new();
        let handle = cache.spawn_sweeper(Duration::from_secs(30), shutdown.clone());
        expect_proceed(cache.begin(&key("r1"))).complete("v".into()).unwrap();

        tokio::time::sleep(Duration::from_secs(331)).await;
        assert!(cache.is_empty());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
