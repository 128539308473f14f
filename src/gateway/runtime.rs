//! 编排运行时：适配器请求 → 幂等缓存 → 防抖合并 → 选端点 / 离线队列 → 工具循环 → 事件流
//!
//! 后台任务（均在 shutdown token 取消后退出）：
//! - 防抖批次处理：合并同一会话的输入，分档、选端点，派发或入队
//! - 派发：为每个逻辑请求启动一次工具循环
//! - 缓存清扫、离线队列投递
//! - 健康监听：端点恢复 CLOSED 时通知离线队列立即投递
//!
//! 一个逻辑请求可能对应多个客户端请求（防抖合并）；结束时先写缓存，再向每个客户端推送终止事件。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::cache::{Admission, CacheKey, CachedOutcome, PendingGuard, ResponseCache};
use super::debounce::{Batch, Debouncer};
use super::message::{EventStream, GatewayEvent, Request};
use super::task_queue::{DeadLetter, DeliveryError, Destination, OfflineQueue};
use crate::config::AppConfig;
use crate::core::{GatewayError, RequestPhase};
use crate::health::{CircuitStatus, FailureClassifier, HealthLedger, HealthRecord};
use crate::llm::{CostTier, Message, ProviderEndpoint, ProviderRegistry};
use crate::observability::{EventBus, ObservabilityEvent};
use crate::react::{LoopEvent, LoopInput, ProviderReflector, ToolLoop};
use crate::tools::{ToolExecutor, ToolRegistry};

/// 无可用端点时请求进入的离线队列目的地
pub const PROVIDERS_DESTINATION: &str = "providers";

/// 运行时参数
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub debounce_window: Duration,
    pub cache_ttl: Duration,
    pub sweep_interval: Duration,
    pub queue_schedule: Vec<Duration>,
    /// partial_output 每块的字符数，0 表示不分块
    pub chunk_chars: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            debounce_window: config.debounce.window(),
            cache_ttl: config.cache.ttl(),
            sweep_interval: config.cache.sweep_interval(),
            queue_schedule: config.queue.schedule(),
            chunk_chars: config.orchestrator.chunk_chars,
        }
    }
}

/// 一个客户端请求的回执通道
struct Member {
    request_id: String,
    guard: PendingGuard,
    tx: mpsc::UnboundedSender<GatewayEvent>,
}

/// 防抖缓冲中的一条输入
struct BufferedInput {
    member: Member,
    payload: String,
    hint: Option<String>,
}

/// 合并后的逻辑请求
struct Execution {
    id: Uuid,
    conversation_id: String,
    members: Vec<Member>,
    messages: Vec<Message>,
    tier: CostTier,
    cancel: CancellationToken,
}

impl Execution {
    fn broadcast_status(&self, phase: RequestPhase, detail: Option<String>) {
        broadcast_status(&self.members, phase, detail);
    }
}

fn broadcast_status(members: &[Member], phase: RequestPhase, detail: Option<String>) {
    for m in members {
        let _ = m.tx.send(GatewayEvent::StatusUpdate {
            request_id: m.request_id.clone(),
            phase,
            detail: detail.clone(),
        });
    }
}

fn send_terminal(tx: &mpsc::UnboundedSender<GatewayEvent>, request_id: &str, outcome: CachedOutcome) {
    let event = match outcome {
        Ok(text) => GatewayEvent::FinalResult {
            request_id: request_id.to_string(),
            text,
        },
        Err(error) => GatewayEvent::Error {
            request_id: request_id.to_string(),
            error,
        },
    };
    let _ = tx.send(event);
}

fn chunks(text: &str, size: usize) -> Vec<String> {
    if size == 0 {
        return Vec::new();
    }
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

/// 结束一个逻辑请求：先完成所有缓存条目，再推送事件
fn finish(members: Vec<Member>, result: Result<String, GatewayError>, chunk_chars: usize) {
    let mut receivers = Vec::with_capacity(members.len());
    for m in members {
        let recorded = match &result {
            Ok(answer) => m.guard.complete(answer.clone()),
            Err(err) => m.guard.fail(err),
        };
        if let Err(e) = recorded {
            tracing::warn!(request_id = %m.request_id, error = %e, "Cache completion rejected");
        }
        receivers.push((m.request_id, m.tx));
    }

    for (request_id, tx) in receivers {
        match &result {
            Ok(answer) => {
                for piece in chunks(answer, chunk_chars) {
                    let _ = tx.send(GatewayEvent::PartialOutput {
                        request_id: request_id.clone(),
                        text: piece,
                    });
                }
                send_terminal(&tx, &request_id, Ok(answer.clone()));
            }
            Err(err) => send_terminal(&tx, &request_id, Err(err.to_payload())),
        }
    }
}

/// 工具循环事件 → 面向适配器的状态更新（不含端点名）
fn status_of(event: &LoopEvent) -> Option<(RequestPhase, Option<String>)> {
    match event {
        LoopEvent::Phase { phase } => Some((*phase, None)),
        LoopEvent::ModelSelected { tier, .. } => {
            Some((RequestPhase::Executing, Some(format!("using a {} model", tier))))
        }
        LoopEvent::Failover { .. } => Some((RequestPhase::Executing, Some("switching model".to_string()))),
        LoopEvent::Retrying { delay_ms, .. } => {
            Some((RequestPhase::Executing, Some(format!("retrying in {}ms", delay_ms))))
        }
        LoopEvent::ToolCall { tool, .. } => Some((RequestPhase::Executing, Some(format!("calling {}", tool)))),
        LoopEvent::ToolFailure { tool, .. } => Some((RequestPhase::Executing, Some(format!("{} failed", tool)))),
        LoopEvent::Observation { .. } | LoopEvent::Reflected { .. } => None,
    }
}

/// 进行中的逻辑请求（用于取消）
struct ActiveRequest {
    conversation_id: String,
    cancel: CancellationToken,
}

type ActiveMap = Arc<Mutex<HashMap<Uuid, ActiveRequest>>>;
type DispatchSender = mpsc::UnboundedSender<(Execution, ProviderEndpoint)>;

/// 等待端点恢复的逻辑请求
pub struct DeferredRequest {
    pub conversation_id: String,
    pub request_ids: Vec<String>,
    pub tier: CostTier,
    pub hint: Option<String>,
    exec: Mutex<Option<Execution>>,
}

impl std::fmt::Debug for DeferredRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredRequest")
            .field("conversation_id", &self.conversation_id)
            .field("request_ids", &self.request_ids)
            .field("tier", &self.tier)
            .field("hint", &self.hint)
            .finish()
    }
}

/// 离线队列目的地：投递即重新选端点，选到则派发
struct DeferredDestination {
    tool_loop: Arc<ToolLoop>,
    dispatch: DispatchSender,
    active: ActiveMap,
    chunk_chars: usize,
}

#[async_trait]
impl Destination<Arc<DeferredRequest>> for DeferredDestination {
    fn name(&self) -> &str {
        PROVIDERS_DESTINATION
    }

    async fn deliver(&self, payload: &Arc<DeferredRequest>) -> Result<(), DeliveryError> {
        let cancelled = payload
            .exec
            .lock()
            .as_ref()
            .map_or(true, |e| e.cancel.is_cancelled());
        if cancelled {
            let exec = payload.exec.lock().take();
            if let Some(exec) = exec {
                self.active.lock().remove(&exec.id);
                finish(exec.members, Err(GatewayError::Cancelled), self.chunk_chars);
            }
            return Ok(());
        }

        let endpoint = self
            .tool_loop
            .select(payload.tier, payload.hint.as_deref(), None, &HashSet::new())
            .ok_or_else(|| DeliveryError::Unavailable("no provider endpoint available".to_string()))?;

        let Some(exec) = payload.exec.lock().take() else {
            return Ok(());
        };
        tracing::info!(execution = %exec.id, endpoint = %endpoint.id(), "Queued request dispatched");
        self.dispatch
            .send((exec, endpoint))
            .map_err(|_| DeliveryError::Rejected("dispatcher stopped".to_string()))
    }

    async fn on_dead_letter(&self, letter: &DeadLetter<Arc<DeferredRequest>>) {
        let Some(exec) = letter.item.payload.exec.lock().take() else {
            return;
        };
        self.active.lock().remove(&exec.id);
        tracing::warn!(
            execution = %exec.id,
            conversation = %exec.conversation_id,
            attempts = letter.item.attempt_count,
            "Queued request gave up"
        );
        let err = GatewayError::QueueExhausted {
            destination: letter.item.destination.clone(),
            attempts: letter.item.attempt_count,
        };
        finish(exec.members, Err(err), self.chunk_chars);
    }
}

struct Inner {
    tool_loop: Arc<ToolLoop>,
    cache: Arc<ResponseCache>,
    debouncer: Debouncer<BufferedInput>,
    queue: Arc<OfflineQueue<Arc<DeferredRequest>>>,
    dispatch: DispatchSender,
    active: ActiveMap,
    events: EventBus,
    shutdown: CancellationToken,
    chunk_chars: usize,
}

/// 编排器（可克隆，所有克隆共享同一运行时）
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// 启动后台任务；events 应与 tool_loop 的健康账本共用同一条总线
    pub fn start(
        tool_loop: Arc<ToolLoop>,
        settings: OrchestratorSettings,
        events: EventBus,
        shutdown: CancellationToken,
    ) -> Self {
        let cache = ResponseCache::new(settings.cache_ttl, events.clone());
        let (debouncer, batches) = Debouncer::new(settings.debounce_window);
        let (dispatch, dispatch_rx) = mpsc::unbounded_channel();
        let active: ActiveMap = Arc::new(Mutex::new(HashMap::new()));

        let destination = DeferredDestination {
            tool_loop: Arc::clone(&tool_loop),
            dispatch: dispatch.clone(),
            active: Arc::clone(&active),
            chunk_chars: settings.chunk_chars,
        };
        let queue = Arc::new(
            OfflineQueue::new(settings.queue_schedule.clone(), events.clone())
                .with_destination(Arc::new(destination)),
        );

        let inner = Arc::new(Inner {
            tool_loop,
            cache: Arc::clone(&cache),
            debouncer,
            queue: Arc::clone(&queue),
            dispatch,
            active,
            events: events.clone(),
            shutdown: shutdown.clone(),
            chunk_chars: settings.chunk_chars,
        });

        cache.spawn_sweeper(settings.sweep_interval, shutdown.clone());
        queue.spawn_worker(shutdown.clone());
        tokio::spawn(run_batches(Arc::clone(&inner), batches));
        tokio::spawn(run_dispatcher(Arc::clone(&inner), dispatch_rx));
        tokio::spawn(watch_recoveries(Arc::clone(&queue), events.subscribe(), shutdown));

        tracing::info!(
            debounce_ms = settings.debounce_window.as_millis() as u64,
            cache_ttl_secs = settings.cache_ttl.as_secs(),
            "Orchestrator started"
        );
        Self { inner }
    }

    /// 由配置组装全部组件并启动
    pub fn from_config(
        config: &AppConfig,
        providers: ProviderRegistry,
        tools: ToolRegistry,
        shutdown: CancellationToken,
    ) -> Result<Self, GatewayError> {
        if config.endpoints.is_empty() {
            return Err(GatewayError::Config("no endpoints configured".to_string()));
        }
        let events = EventBus::default();
        let ledger = Arc::new(HealthLedger::from_config(
            &config.endpoints,
            &config.resilience,
            events.clone(),
        ));
        let classifier = Arc::new(FailureClassifier::from_config(&config.resilience)?);
        let executor = ToolExecutor::new(tools, config.orchestrator.tool_timeout());

        let mut tool_loop = ToolLoop::from_config(providers, ledger, executor, classifier, &config.orchestrator);
        if config.orchestrator.reflect {
            tool_loop = tool_loop.with_reflector(Arc::new(ProviderReflector::default()));
        }

        Ok(Self::start(
            Arc::new(tool_loop),
            OrchestratorSettings::from_config(config),
            events,
            shutdown,
        ))
    }

    /// 提交请求；同一会话内同一 ID 的重复提交共享同一次执行的结果
    pub fn submit(&self, request: Request) -> EventStream {
        let (tx, stream) = EventStream::channel();
        let key = CacheKey::new(&request.conversation_id, &request.id);
        match self.inner.cache.begin(&key) {
            Admission::Ready(outcome) => send_terminal(&tx, &request.id, outcome),
            Admission::InFlight(waiter) => {
                let request_id = request.id;
                tokio::spawn(async move {
                    let outcome = waiter.wait().await;
                    send_terminal(&tx, &request_id, outcome);
                });
            }
            Admission::Proceed(guard) => {
                let _ = tx.send(GatewayEvent::StatusUpdate {
                    request_id: request.id.clone(),
                    phase: RequestPhase::Buffering,
                    detail: None,
                });
                let input = BufferedInput {
                    member: Member {
                        request_id: request.id,
                        guard,
                        tx,
                    },
                    payload: request.payload,
                    hint: request.desired_model_hint,
                };
                self.inner.debouncer.push(&request.conversation_id, input);
            }
        }
        stream
    }

    /// 取消某会话所有进行中（含排队中）的逻辑请求。
    ///
    /// 排队中的请求直接出队并以 Cancelled 结束，其他会话的排队条目不受影响。
    pub fn cancel(&self, conversation_id: &str) -> bool {
        let mut cancelled = false;
        {
            let active = self.inner.active.lock();
            for req in active.values().filter(|r| r.conversation_id == conversation_id) {
                req.cancel.cancel();
                cancelled = true;
            }
        }
        if !cancelled {
            return false;
        }

        let dequeued = self
            .inner
            .queue
            .remove_where(PROVIDERS_DESTINATION, |p| p.conversation_id == conversation_id);
        for item in dequeued {
            let exec = item.payload.exec.lock().take();
            if let Some(exec) = exec {
                self.inner.active.lock().remove(&exec.id);
                finish(exec.members, Err(GatewayError::Cancelled), self.inner.chunk_chars);
            }
        }
        tracing::info!(conversation = %conversation_id, "Conversation cancelled");
        true
    }

    pub fn ledger_snapshot(&self) -> Vec<HealthRecord> {
        self.inner.tool_loop.ledger().snapshot()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter<Arc<DeferredRequest>>> {
        self.inner.queue.dead_letters()
    }

    /// 排队等待端点的逻辑请求数
    pub fn queued(&self) -> usize {
        self.inner.queue.len(PROVIDERS_DESTINATION)
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.inner.cache
    }
}

impl Inner {
    /// 合并一批输入为一个逻辑请求，分档并选端点
    fn handle_batch(&self, batch: Batch<BufferedInput>) {
        let id = Uuid::new_v4();
        let hint = batch.items.iter().rev().find_map(|i| i.hint.clone());
        let mut payloads = Vec::with_capacity(batch.items.len());
        let mut members = Vec::with_capacity(batch.items.len());
        for input in batch.items {
            payloads.push(input.payload);
            members.push(input.member);
        }
        tracing::info!(
            execution = %id,
            conversation = %batch.key,
            inputs = members.len(),
            waited_ms = batch.flushed_at.duration_since(batch.first_arrival).as_millis() as u64,
            "Logical request formed"
        );

        broadcast_status(&members, RequestPhase::Classifying, None);
        let messages = vec![Message::user(payloads.join("\n"))];
        let tier = self.tool_loop.classify(&messages);

        let cancel = self.shutdown.child_token();
        self.active.lock().insert(
            id,
            ActiveRequest {
                conversation_id: batch.key.clone(),
                cancel: cancel.clone(),
            },
        );
        let exec = Execution {
            id,
            conversation_id: batch.key,
            members,
            messages,
            tier,
            cancel,
        };
        exec.broadcast_status(RequestPhase::SelectingModel, Some(format!("{} tier", tier)));

        let selected = self.tool_loop.select(tier, hint.as_deref(), None, &HashSet::new());
        match selected {
            Some(endpoint) => {
                if let Err(mpsc::error::SendError((exec, _))) = self.dispatch.send((exec, endpoint)) {
                    self.active.lock().remove(&exec.id);
                    finish(exec.members, Err(GatewayError::Cancelled), self.chunk_chars);
                }
            }
            None => {
                tracing::warn!(execution = %id, tier = %tier, "No endpoint available, queueing");
                exec.broadcast_status(RequestPhase::Queued, None);
                let deferred = Arc::new(DeferredRequest {
                    conversation_id: exec.conversation_id.clone(),
                    request_ids: exec.members.iter().map(|m| m.request_id.clone()).collect(),
                    tier,
                    hint,
                    exec: Mutex::new(Some(exec)),
                });
                self.queue.enqueue(PROVIDERS_DESTINATION, deferred);
            }
        }
    }

    /// 运行一个逻辑请求直到结束
    async fn execute(self: Arc<Self>, exec: Execution, endpoint: ProviderEndpoint) {
        let Execution {
            id,
            members,
            messages,
            tier,
            cancel,
            ..
        } = exec;

        let (loop_tx, mut loop_rx) = mpsc::unbounded_channel::<LoopEvent>();
        let receivers: Vec<(String, mpsc::UnboundedSender<GatewayEvent>)> = members
            .iter()
            .map(|m| (m.request_id.clone(), m.tx.clone()))
            .collect();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = loop_rx.recv().await {
                let Some((phase, detail)) = status_of(&event) else {
                    continue;
                };
                for (request_id, tx) in &receivers {
                    let _ = tx.send(GatewayEvent::StatusUpdate {
                        request_id: request_id.clone(),
                        phase,
                        detail: detail.clone(),
                    });
                }
            }
        });

        let input = LoopInput {
            request_id: id.to_string(),
            messages,
            tier,
            endpoint,
        };
        let result = self.tool_loop.run(input, Some(&loop_tx), &cancel).await;
        drop(loop_tx);
        let _ = forwarder.await;
        self.active.lock().remove(&id);

        match &result {
            Ok(outcome) => tracing::info!(execution = %id, iterations = outcome.iterations, "Logical request done"),
            Err(e) => tracing::warn!(execution = %id, error = %e, "Logical request failed"),
        }
        finish(members, result.map(|o| o.answer), self.chunk_chars);
    }
}

async fn run_batches(inner: Arc<Inner>, mut batches: mpsc::UnboundedReceiver<Batch<BufferedInput>>) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => {
                inner.debouncer.flush_all();
                while let Ok(batch) = batches.try_recv() {
                    let members = batch.items.into_iter().map(|i| i.member).collect();
                    finish(members, Err(GatewayError::Cancelled), inner.chunk_chars);
                }
                break;
            }
            batch = batches.recv() => match batch {
                Some(batch) => inner.handle_batch(batch),
                None => break,
            },
        }
    }
}

async fn run_dispatcher(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<(Execution, ProviderEndpoint)>) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            next = rx.recv() => match next {
                Some((exec, endpoint)) => {
                    tokio::spawn(Arc::clone(&inner).execute(exec, endpoint));
                }
                None => break,
            },
        }
    }
}

/// 端点恢复 CLOSED 时唤醒离线队列
async fn watch_recoveries(
    queue: Arc<OfflineQueue<Arc<DeferredRequest>>>,
    mut events: broadcast::Receiver<ObservabilityEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            ev = events.recv() => match ev {
                Ok(ObservabilityEvent::EndpointStatusChanged { to: CircuitStatus::Closed, .. }) => {
                    queue.signal_reachable(PROVIDERS_DESTINATION);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Recovery watcher lagged");
                    queue.signal_reachable(PROVIDERS_DESTINATION);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
