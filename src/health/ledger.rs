//! 提供方健康账本：每个端点一条熔断记录
//!
//! 状态机：CLOSED →(冷却)→ OPEN →(冷却到期后首个调用方取得探测许可)→ HALF_OPEN
//! → 探测成功 CLOSED / 探测失败 OPEN（冷却升级）。
//!
//! 记录在构造时一次性建好，之后只有各自的 Mutex 被修改；临界区内不做任何 await。
//! 账本只是建议性的，不持久化，重启即清空。

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::ResilienceSection;
use crate::health::{
    CallOutcome, Cooldown, CooldownPolicy, CooldownScope, FailureClass, PolicyDecision,
    RetryAction,
};
use crate::llm::{EndpointId, ProviderEndpoint};
use crate::observability::{EventBus, ObservabilityEvent};

/// 熔断状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

/// 单个端点的健康记录
#[derive(Debug, Clone)]
pub struct HealthRecord {
    pub endpoint: ProviderEndpoint,
    pub status: CircuitStatus,
    pub cooldown_until: Option<Instant>,
    pub consecutive_failures: u32,
    /// 最近的失败类别（有界环形缓冲）
    pub failure_class_history: VecDeque<FailureClass>,
    /// 当前同类连续失败的类别与长度（阶梯下标）
    pub streak_class: Option<FailureClass>,
    pub streak: u32,
    /// HALF_OPEN 探测许可的发放时刻
    pub probe_granted_at: Option<Instant>,
}

impl HealthRecord {
    fn new(endpoint: ProviderEndpoint) -> Self {
        Self {
            endpoint,
            status: CircuitStatus::Closed,
            cooldown_until: None,
            consecutive_failures: 0,
            failure_class_history: VecDeque::new(),
            streak_class: None,
            streak: 0,
            probe_granted_at: None,
        }
    }

    /// 打开熔断；已有更晚的冷却到期时间时保留较晚者
    fn open_until(&mut self, until: Instant) {
        self.status = CircuitStatus::Open;
        self.probe_granted_at = None;
        self.cooldown_until = Some(match self.cooldown_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }
}

/// 候选端点的扫描顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionOrder {
    /// 按调用方给出的顺序
    AsGiven,
    /// 成本档位低者优先，同档位按连续失败次数少者优先，再按声明顺序
    CheapestFirst,
}

struct StatusChange {
    endpoint: EndpointId,
    from: CircuitStatus,
    to: CircuitStatus,
    class: Option<FailureClass>,
    cooldown: Option<Duration>,
}

/// 健康账本
pub struct HealthLedger {
    records: HashMap<EndpointId, Mutex<HealthRecord>>,
    /// 声明顺序（打破平局、快照输出）
    order: Vec<EndpointId>,
    policy: CooldownPolicy,
    history_len: usize,
    probe_lease: Duration,
    events: EventBus,
}

impl HealthLedger {
    pub fn new(endpoints: &[ProviderEndpoint], policy: CooldownPolicy, events: EventBus) -> Self {
        let mut records = HashMap::new();
        let mut order = Vec::new();
        for ep in endpoints {
            let id = ep.id();
            if records.contains_key(&id) {
                tracing::warn!(endpoint = %id, "Duplicate endpoint in configuration, keeping the first");
                continue;
            }
            records.insert(id.clone(), Mutex::new(HealthRecord::new(ep.clone())));
            order.push(id);
        }
        Self {
            records,
            order,
            policy,
            history_len: 16,
            probe_lease: Duration::from_secs(300),
            events,
        }
    }

    pub fn from_config(
        endpoints: &[ProviderEndpoint],
        section: &ResilienceSection,
        events: EventBus,
    ) -> Self {
        Self::new(endpoints, CooldownPolicy::from_config(section), events)
            .with_history_len(section.history_len)
            .with_probe_lease(Duration::from_secs(section.probe_lease_secs))
    }

    pub fn with_history_len(mut self, len: usize) -> Self {
        self.history_len = len.max(1);
        self
    }

    pub fn with_probe_lease(mut self, lease: Duration) -> Self {
        self.probe_lease = lease;
        self
    }

    pub fn policy(&self) -> &CooldownPolicy {
        &self.policy
    }

    /// 声明顺序的全部端点
    pub fn endpoints(&self) -> Vec<ProviderEndpoint> {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id))
            .map(|r| r.lock().endpoint.clone())
            .collect()
    }

    /// 报告一次调用结果；失败时返回策略决策（已按 HALF_OPEN 规则修正）
    pub fn report(&self, endpoint: &EndpointId, outcome: CallOutcome) -> Option<PolicyDecision> {
        let Some(cell) = self.records.get(endpoint) else {
            tracing::warn!(endpoint = %endpoint, "Outcome reported for unknown endpoint");
            return None;
        };
        let now = Instant::now();
        let mut changes = Vec::new();

        let (decision, provider_cooldown) = {
            let mut rec = cell.lock();
            let before = rec.status;
            match outcome {
                CallOutcome::Success => {
                    rec.consecutive_failures = 0;
                    rec.streak = 0;
                    rec.streak_class = None;
                    rec.probe_granted_at = None;
                    if before != CircuitStatus::Closed {
                        rec.status = CircuitStatus::Closed;
                        rec.cooldown_until = None;
                        changes.push(StatusChange {
                            endpoint: endpoint.clone(),
                            from: before,
                            to: CircuitStatus::Closed,
                            class: None,
                            cooldown: None,
                        });
                    }
                    (None, None)
                }
                CallOutcome::Failure(class) => {
                    rec.consecutive_failures = rec.consecutive_failures.saturating_add(1);
                    rec.failure_class_history.push_back(class);
                    while rec.failure_class_history.len() > self.history_len {
                        rec.failure_class_history.pop_front();
                    }
                    if rec.streak_class == Some(class) {
                        rec.streak = rec.streak.saturating_add(1);
                    } else {
                        rec.streak_class = Some(class);
                        rec.streak = 1;
                    }

                    let mut decision = self.policy.decide(class, rec.streak);
                    // HALF_OPEN 下的任何失败都回到 OPEN
                    if before == CircuitStatus::HalfOpen && decision.cooldown.is_none() {
                        decision = PolicyDecision {
                            action: RetryAction::Failover,
                            cooldown: Some(self.policy.first_step(class)),
                        };
                    }

                    let mut provider_cooldown = None;
                    if let Some(Cooldown { duration, scope }) = decision.cooldown {
                        rec.open_until(now + duration);
                        if before != CircuitStatus::Open {
                            changes.push(StatusChange {
                                endpoint: endpoint.clone(),
                                from: before,
                                to: CircuitStatus::Open,
                                class: Some(class),
                                cooldown: Some(duration),
                            });
                        }
                        if scope == CooldownScope::Provider {
                            provider_cooldown =
                                Some((rec.endpoint.provider.clone(), now + duration, duration, class));
                        }
                    }
                    tracing::debug!(
                        endpoint = %endpoint,
                        class = ?class,
                        streak = rec.streak,
                        consecutive_failures = rec.consecutive_failures,
                        action = ?decision.action,
                        "Provider failure recorded"
                    );
                    (Some(decision), provider_cooldown)
                }
            }
        };

        if let Some((provider, until, duration, class)) = provider_cooldown {
            for id in &self.order {
                if id == endpoint {
                    continue;
                }
                let Some(cell) = self.records.get(id) else {
                    continue;
                };
                let mut rec = cell.lock();
                if rec.endpoint.provider != provider {
                    continue;
                }
                let before = rec.status;
                rec.open_until(until);
                if before != CircuitStatus::Open {
                    changes.push(StatusChange {
                        endpoint: id.clone(),
                        from: before,
                        to: CircuitStatus::Open,
                        class: Some(class),
                        cooldown: Some(duration),
                    });
                }
            }
        }

        self.publish(changes);
        decision
    }

    /// CLOSED 返回 true；OPEN 且冷却已到期时转 HALF_OPEN 并把唯一的探测许可交给本调用方。
    /// HALF_OPEN 期间其它调用方得到 false，除非上一个探测许可已超过租约。
    pub fn is_available(&self, endpoint: &EndpointId) -> bool {
        let Some(cell) = self.records.get(endpoint) else {
            return false;
        };
        let now = Instant::now();
        let mut change = None;
        let available = {
            let mut rec = cell.lock();
            match rec.status {
                CircuitStatus::Closed => true,
                CircuitStatus::Open => {
                    let expired = rec.cooldown_until.map_or(true, |until| now >= until);
                    if expired {
                        rec.status = CircuitStatus::HalfOpen;
                        rec.probe_granted_at = Some(now);
                        change = Some(StatusChange {
                            endpoint: endpoint.clone(),
                            from: CircuitStatus::Open,
                            to: CircuitStatus::HalfOpen,
                            class: rec.streak_class,
                            cooldown: None,
                        });
                    }
                    expired
                }
                CircuitStatus::HalfOpen => {
                    let lease_expired = rec
                        .probe_granted_at
                        .map_or(true, |granted| now >= granted + self.probe_lease);
                    if lease_expired {
                        tracing::debug!(endpoint = %endpoint, "Probe lease expired, granting a new probe");
                        rec.probe_granted_at = Some(now);
                    }
                    lease_expired
                }
            }
        };
        self.publish(change.into_iter().collect());
        available
    }

    /// 不发放探测许可的只读检查
    pub fn status(&self, endpoint: &EndpointId) -> Option<CircuitStatus> {
        self.records.get(endpoint).map(|cell| cell.lock().status)
    }

    /// 按 ordering 扫描候选端点，返回第一个可用者
    pub fn next_available_endpoint(
        &self,
        candidates: &[ProviderEndpoint],
        ordering: SelectionOrder,
    ) -> Option<ProviderEndpoint> {
        let mut ranked: Vec<(usize, &ProviderEndpoint, u32)> = candidates
            .iter()
            .enumerate()
            .map(|(i, ep)| {
                let failures = self
                    .records
                    .get(&ep.id())
                    .map(|cell| cell.lock().consecutive_failures)
                    .unwrap_or(u32::MAX);
                (i, ep, failures)
            })
            .collect();

        if ordering == SelectionOrder::CheapestFirst {
            ranked.sort_by_key(|(i, ep, failures)| (ep.cost_tier, *failures, *i));
        }

        ranked
            .into_iter()
            .map(|(_, ep, _)| ep)
            .find(|ep| self.is_available(&ep.id()))
            .cloned()
    }

    pub fn record(&self, endpoint: &EndpointId) -> Option<HealthRecord> {
        self.records.get(endpoint).map(|cell| cell.lock().clone())
    }

    /// 全部记录的只读副本（声明顺序）
    pub fn snapshot(&self) -> Vec<HealthRecord> {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id))
            .map(|cell| cell.lock().clone())
            .collect()
    }

    fn publish(&self, changes: Vec<StatusChange>) {
        for c in changes {
            self.events.emit(ObservabilityEvent::EndpointStatusChanged {
                endpoint: c.endpoint,
                from: c.from,
                to: c.to,
                failure_class: c.class,
                cooldown_secs: c.cooldown.map(|d| d.as_secs()),
                at: Utc::now(),
            });
        }
    }
}
