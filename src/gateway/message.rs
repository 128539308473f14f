//! 适配器协议：请求与事件流
//!
//! 适配器调用 submit(Request) 得到 EventStream，依次收到若干 status_update / partial_output，
//! 最后恰好一个 final_result 或 error。

use std::pin::Pin;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::{ErrorPayload, RequestPhase};

/// 客户端请求（被接纳后不可变）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// 客户端提供的 ID，同一会话内唯一；重复提交同一 ID 得到同一结果
    pub id: String,
    pub conversation_id: String,
    pub payload: String,
    pub arrival_time: DateTime<Utc>,
    /// 可选：`provider:model` 或 model 名
    #[serde(default)]
    pub desired_model_hint: Option<String>,
}

impl Request {
    pub fn new(
        id: impl Into<String>,
        conversation_id: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            conversation_id: conversation_id.into(),
            payload: payload.into(),
            arrival_time: Utc::now(),
            desired_model_hint: None,
        }
    }

    pub fn with_model_hint(mut self, hint: impl Into<String>) -> Self {
        self.desired_model_hint = Some(hint.into());
        self
    }
}

/// 推给适配器的事件（不含端点、冷却等内部细节）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    StatusUpdate {
        request_id: String,
        phase: RequestPhase,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    PartialOutput {
        request_id: String,
        text: String,
    },
    FinalResult {
        request_id: String,
        text: String,
    },
    Error {
        request_id: String,
        error: ErrorPayload,
    },
}

impl GatewayEvent {
    pub fn request_id(&self) -> &str {
        match self {
            GatewayEvent::StatusUpdate { request_id, .. }
            | GatewayEvent::PartialOutput { request_id, .. }
            | GatewayEvent::FinalResult { request_id, .. }
            | GatewayEvent::Error { request_id, .. } => request_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, GatewayEvent::FinalResult { .. } | GatewayEvent::Error { .. })
    }

    /// 终止事件的结果；非终止事件返回 None
    pub fn outcome(&self) -> Option<Result<&str, &ErrorPayload>> {
        match self {
            GatewayEvent::FinalResult { text, .. } => Some(Ok(text)),
            GatewayEvent::Error { error, .. } => Some(Err(error)),
            _ => None,
        }
    }
}

/// 单个请求的事件流
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<GatewayEvent>,
}

impl EventStream {
    pub(crate) fn channel() -> (mpsc::UnboundedSender<GatewayEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// 一直读到终止事件，返回途中收到的全部事件
    pub async fn collect_until_terminal(mut self) -> Vec<GatewayEvent> {
        let mut events = Vec::new();
        while let Some(ev) = self.rx.recv().await {
            let done = ev.is_terminal();
            events.push(ev);
            if done {
                break;
            }
        }
        events
    }
}

impl Stream for EventStream {
    type Item = GatewayEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_stream_yields_in_order() {
        let (tx, mut stream) = EventStream::channel();
        tx.send(GatewayEvent::PartialOutput {
            request_id: "r".into(),
            text: "he".into(),
        })
        .unwrap();
        tx.send(GatewayEvent::FinalResult {
            request_id: "r".into(),
            text: "hello".into(),
        })
        .unwrap();
        drop(tx);

        let first = stream.next().await.unwrap();
        assert!(!first.is_terminal());
        let last = stream.next().await.unwrap();
        assert_eq!(last.outcome(), Some(Ok("hello")));
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_error_event_json_shape() {
        let ev = GatewayEvent::Error {
            request_id: "r1".into(),
            error: ErrorPayload {
                kind: ErrorKind::Billing,
                message: "quota".into(),
            },
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["error"]["kind"], "billing");
        assert_eq!(ev.request_id(), "r1");
    }
}
