//! 离线队列：目的地暂不可达时的按目的地 FIFO 缓冲
//!
//! - 入队时 attempt_count = 0，首次尝试安排在 schedule[0] 之后
//! - 每次投递失败 attempt_count + 1；达到 schedule 长度后转入死信，否则按 schedule[attempt_count] 再排
//! - 目的地明确拒绝（Rejected）的条目直接转入死信
//! - 死信只追加、可查看、永不自动重试
//!
//! 触发投递的有两种信号：定时到期，以及 signal_reachable(目的地) 的显式通知。
//! 后者让未到期的条目提前尝试一次，失败时不计入 attempt_count。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::observability::{EventBus, ObservabilityEvent};

/// 投递失败
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// 暂时不可达，按计划重试
    #[error("destination unavailable: {0}")]
    Unavailable(String),
    /// 永久拒绝，直接进死信
    #[error("rejected: {0}")]
    Rejected(String),
}

/// 投递目的地
#[async_trait]
pub trait Destination<P>: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, payload: &P) -> Result<(), DeliveryError>;

    /// 条目转入死信后回调（用于通知等待方）
    async fn on_dead_letter(&self, _letter: &DeadLetter<P>) {}
}

/// 队列条目
#[derive(Debug, Clone)]
pub struct QueueItem<P> {
    pub id: Uuid,
    pub destination: String,
    pub payload: P,
    pub attempt_count: u32,
    pub next_attempt_at: Instant,
    pub enqueued_at: DateTime<Utc>,
}

/// 死信记录
#[derive(Debug, Clone)]
pub struct DeadLetter<P> {
    pub item: QueueItem<P>,
    pub reason: String,
    pub dead_at: DateTime<Utc>,
}

/// 一轮投递的统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
}

/// 离线队列
pub struct OfflineQueue<P> {
    destinations: HashMap<String, Arc<dyn Destination<P>>>,
    queues: Mutex<HashMap<String, VecDeque<QueueItem<P>>>>,
    dead_letters: Mutex<Vec<DeadLetter<P>>>,
    /// 收到可达信号、下一轮忽略 next_attempt_at 的目的地
    reachable: Mutex<HashSet<String>>,
    schedule: Vec<Duration>,
    notify: Notify,
    events: EventBus,
}

impl<P: Clone + Send + Sync + 'static> OfflineQueue<P> {
    pub fn new(schedule: Vec<Duration>, events: EventBus) -> Self {
        Self {
            destinations: HashMap::new(),
            queues: Mutex::new(HashMap::new()),
            dead_letters: Mutex::new(Vec::new()),
            reachable: Mutex::new(HashSet::new()),
            schedule,
            notify: Notify::new(),
            events,
        }
    }

    pub fn with_destination(mut self, destination: Arc<dyn Destination<P>>) -> Self {
        self.destinations
            .insert(destination.name().to_string(), destination);
        self
    }

    /// 入队；目的地未注册时返回 false
    pub fn enqueue(&self, destination: &str, payload: P) -> bool {
        if !self.destinations.contains_key(destination) {
            tracing::warn!(destination = %destination, "Enqueue to unknown destination");
            return false;
        }
        let first_delay = self.schedule.first().copied().unwrap_or_default();
        let item = QueueItem {
            id: Uuid::new_v4(),
            destination: destination.to_string(),
            payload,
            attempt_count: 0,
            next_attempt_at: Instant::now() + first_delay,
            enqueued_at: Utc::now(),
        };
        tracing::info!(
            destination = %destination,
            item_id = %item.id,
            retry_in_ms = first_delay.as_millis() as u64,
            "Queued for later delivery"
        );
        self.queues
            .lock()
            .entry(destination.to_string())
            .or_default()
            .push_back(item);
        self.notify.notify_one();
        true
    }

    /// 目的地恢复可达：下一轮立即尝试其全部条目
    pub fn signal_reachable(&self, destination: &str) {
        let has_items = self
            .queues
            .lock()
            .get(destination)
            .map_or(false, |q| !q.is_empty());
        if has_items {
            tracing::debug!(destination = %destination, "Destination reachable, draining");
            self.reachable.lock().insert(destination.to_string());
            self.notify.notify_one();
        }
    }

    pub fn len(&self, destination: &str) -> usize {
        self.queues.lock().get(destination).map_or(0, |q| q.len())
    }

    pub fn is_empty(&self) -> bool {
        self.queues.lock().values().all(|q| q.is_empty())
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter<P>> {
        self.dead_letters.lock().clone()
    }

    /// 最早的到期时间
    pub fn next_due(&self) -> Option<Instant> {
        self.queues
            .lock()
            .values()
            .flat_map(|q| q.iter().map(|i| i.next_attempt_at))
            .min()
    }

    /// 移除某目的地上满足条件的条目（不计尝试、不进死信），按原顺序返回
    pub fn remove_where<F>(&self, destination: &str, predicate: F) -> Vec<QueueItem<P>>
    where
        F: Fn(&P) -> bool,
    {
        let mut queues = self.queues.lock();
        let Some(queue) = queues.get_mut(destination) else {
            return Vec::new();
        };
        let (removed, kept): (VecDeque<_>, VecDeque<_>) =
            queue.drain(..).partition(|item| predicate(&item.payload));
        *queue = kept;
        removed.into()
    }

    /// 按 FIFO 顺序尝试每个到期条目，各条目按自己的计划推进。
    ///
    /// 收到可达信号的目的地本轮尝试全部条目；提前于计划的尝试若失败，
    /// 条目原样放回，不消耗重试阶段。
    pub async fn drain_due(&self, now: Instant) -> DrainReport {
        let forced: HashSet<String> = std::mem::take(&mut *self.reachable.lock());
        let mut report = DrainReport::default();

        for (name, destination) in &self.destinations {
            let force = forced.contains(name);
            let candidates: Vec<Uuid> = self
                .queues
                .lock()
                .get(name)
                .map(|q| {
                    q.iter()
                        .filter(|i| force || i.next_attempt_at <= now)
                        .map(|i| i.id)
                        .collect()
                })
                .unwrap_or_default();

            for id in candidates {
                // 投递期间条目移出队列，失败后放回原位
                let taken = {
                    let mut queues = self.queues.lock();
                    queues.get_mut(name).and_then(|q| {
                        let pos = q.iter().position(|i| i.id == id)?;
                        q.remove(pos).map(|item| (pos, item))
                    })
                };
                let Some((pos, mut item)) = taken else {
                    continue;
                };
                let on_schedule = item.next_attempt_at <= now;

                match destination.deliver(&item.payload).await {
                    Ok(()) => {
                        tracing::info!(destination = %name, item_id = %item.id, attempts = item.attempt_count + 1, "Queued item delivered");
                        report.delivered += 1;
                    }
                    Err(DeliveryError::Rejected(reason)) => {
                        item.attempt_count += 1;
                        self.dead_letter(destination.as_ref(), item, reason).await;
                        report.dead_lettered += 1;
                    }
                    Err(DeliveryError::Unavailable(reason)) if !on_schedule => {
                        tracing::debug!(destination = %name, item_id = %item.id, reason = %reason, "Early delivery failed, schedule kept");
                        self.put_back(name, pos, item);
                    }
                    Err(DeliveryError::Unavailable(reason)) => {
                        item.attempt_count += 1;
                        match self.schedule.get(item.attempt_count as usize) {
                            Some(delay) => {
                                item.next_attempt_at = Instant::now() + *delay;
                                tracing::debug!(
                                    destination = %name,
                                    item_id = %item.id,
                                    attempts = item.attempt_count,
                                    retry_in_ms = delay.as_millis() as u64,
                                    reason = %reason,
                                    "Delivery failed, rescheduled"
                                );
                                self.put_back(name, pos, item);
                                report.rescheduled += 1;
                            }
                            None => {
                                self.dead_letter(destination.as_ref(), item, reason).await;
                                report.dead_lettered += 1;
                            }
                        }
                    }
                }
            }
        }
        report
    }

    fn put_back(&self, destination: &str, pos: usize, item: QueueItem<P>) {
        let mut queues = self.queues.lock();
        let queue = queues.entry(destination.to_string()).or_default();
        let pos = pos.min(queue.len());
        queue.insert(pos, item);
    }

    async fn dead_letter(&self, destination: &dyn Destination<P>, item: QueueItem<P>, reason: String) {
        let letter = DeadLetter {
            item,
            reason,
            dead_at: Utc::now(),
        };
        self.events.emit(ObservabilityEvent::DeadLettered {
            destination: letter.item.destination.clone(),
            item_id: letter.item.id,
            attempts: letter.item.attempt_count,
            reason: letter.reason.clone(),
            at: letter.dead_at,
        });
        destination.on_dead_letter(&letter).await;
        self.dead_letters.lock().push(letter);
    }

    /// 后台投递循环：定时到期或收到通知时处理，shutdown 后退出
    pub fn spawn_worker(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let report = queue.drain_due(Instant::now()).await;
                if report != DrainReport::default() {
                    tracing::debug!(?report, "Queue drain");
                }
                let wake_at = queue
                    .next_due()
                    .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = queue.notify.notified() => {}
                    _ = tokio::time::sleep_until(wake_at) => {}
                }
            }
        })
    }
}
