//! 可观测性：tracing 初始化与事件总线
//!
//! 事件总线是一条 broadcast 通道；每个事件同时写入 tracing，没有订阅者时只留日志。

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::health::{CircuitStatus, FailureClass};
use crate::llm::EndpointId;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 安装全局 subscriber（默认 info，RUST_LOG 可覆盖）
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

/// 网关内部事件（运维视角，可能包含端点、冷却等细节）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObservabilityEvent {
    EndpointStatusChanged {
        endpoint: EndpointId,
        from: CircuitStatus,
        to: CircuitStatus,
        failure_class: Option<FailureClass>,
        cooldown_secs: Option<u64>,
        at: DateTime<Utc>,
    },
    CacheHit {
        conversation_id: String,
        request_id: String,
    },
    CacheMiss {
        conversation_id: String,
        request_id: String,
    },
    DeadLettered {
        destination: String,
        item_id: Uuid,
        attempts: u32,
        reason: String,
        at: DateTime<Utc>,
    },
    ContractViolation {
        detail: String,
    },
}

/// 事件总线（可克隆，所有克隆共享同一通道）
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ObservabilityEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ObservabilityEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ObservabilityEvent) {
        match &event {
            ObservabilityEvent::EndpointStatusChanged {
                endpoint,
                from,
                to,
                failure_class,
                cooldown_secs,
                ..
            } => {
                tracing::info!(
                    endpoint = %endpoint,
                    from = ?from,
                    to = ?to,
                    failure_class = ?failure_class,
                    cooldown_secs = ?cooldown_secs,
                    "Endpoint status changed"
                );
            }
            ObservabilityEvent::CacheHit {
                conversation_id,
                request_id,
            } => {
                tracing::debug!(conversation = %conversation_id, request_id = %request_id, "Cache hit");
            }
            ObservabilityEvent::CacheMiss {
                conversation_id,
                request_id,
            } => {
                tracing::debug!(conversation = %conversation_id, request_id = %request_id, "Cache miss");
            }
            ObservabilityEvent::DeadLettered {
                destination,
                item_id,
                attempts,
                reason,
                ..
            } => {
                tracing::warn!(
                    destination = %destination,
                    item_id = %item_id,
                    attempts,
                    reason = %reason,
                    "Queue item dead-lettered"
                );
            }
            ObservabilityEvent::ContractViolation { detail } => {
                tracing::warn!(detail = %detail, "Contract violation");
            }
        }
        // 没有订阅者时 send 返回 Err，忽略即可
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_subscriber() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(ObservabilityEvent::CacheMiss {
            conversation_id: "c1".into(),
            request_id: "r1".into(),
        });
        match rx.recv().await.unwrap() {
            ObservabilityEvent::CacheMiss { request_id, .. } => assert_eq!(request_id, "r1"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_dead_letter_event_serializes_item_id() {
        let item_id = Uuid::new_v4();
        let json = serde_json::to_value(ObservabilityEvent::DeadLettered {
            destination: "providers".into(),
            item_id,
            attempts: 3,
            reason: "no provider endpoint available".into(),
            at: Utc::now(),
        })
        .unwrap();
        assert_eq!(json["type"], "dead_lettered");
        assert_eq!(json["item_id"], item_id.to_string());
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.emit(ObservabilityEvent::ContractViolation {
            detail: "double complete".into(),
        });
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(ObservabilityEvent::CacheHit {
            conversation_id: "c1".into(),
            request_id: "r9".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "cache_hit");
        assert_eq!(json["conversation_id"], "c1");
    }
}
