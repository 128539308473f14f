//! 工具循环过程事件：由编排层翻译为面向适配器的 GatewayEvent

use serde::Serialize;

use crate::core::RequestPhase;
use crate::health::FailureClass;
use crate::llm::{CostTier, EndpointId};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    /// 进入新的阶段
    Phase { phase: RequestPhase },
    /// 选定（或升档切换到）某个端点
    ModelSelected { endpoint: EndpointId, tier: CostTier },
    /// 端点失败，切换到下一个候选
    Failover {
        from: EndpointId,
        class: Option<FailureClass>,
    },
    /// 短暂故障后原地重试
    Retrying { endpoint: EndpointId, delay_ms: u64 },
    ToolCall {
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（预览）
    Observation { tool: String, preview: String },
    /// 工具失败，已回填给模型
    ToolFailure { tool: String, reason: String },
    /// 反思结束；changed 表示答案被改写
    Reflected { changed: bool },
}
