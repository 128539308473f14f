//! 网关错误类型与对外错误分类
//!
//! GatewayError 是编排层内部的统一错误；ErrorKind 是交给适配器的稳定分类，
//! 对外只暴露 {kind, message}，端点、冷却档位等细节只进日志与可观测性事件。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 编排过程中可能出现的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// 可重试的短暂故障（超时 / 5xx / 429），所有可用端点都已尝试
    #[error("Transient provider failure: {0}")]
    Transient(String),

    /// 凭据失效，需外部修复
    #[error("Provider authentication failed: {0}")]
    Auth(String),

    /// 额度或余额耗尽
    #[error("Provider billing exhausted: {0}")]
    Billing(String),

    /// 请求级或工具级超时
    #[error("Timed out: {0}")]
    Timeout(String),

    /// 单次工具调用失败（通常回填给模型，而不是直接失败请求）
    #[error("Tool {tool} failed: {reason}")]
    ToolFailure { tool: String, reason: String },

    /// 离线队列重试计划耗尽
    #[error("Delivery to {destination} gave up after {attempts} attempts")]
    QueueExhausted { destination: String, attempts: u32 },

    /// 内部约定被破坏（如同一缓存条目重复完成），只记录不上抛
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    #[error("Request cancelled")]
    Cancelled,

    /// 与端点健康无关的提供方错误（如请求格式被拒绝）
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Config error: {0}")]
    Config(String),
}

/// 对外稳定的错误分类（序列化为 snake_case）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Auth,
    Billing,
    Timeout,
    ToolFailure,
    QueueExhausted,
    ContractViolation,
    Cancelled,
    Provider,
    Config,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Auth => "auth",
            ErrorKind::Billing => "billing",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ToolFailure => "tool_failure",
            ErrorKind::QueueExhausted => "queue_exhausted",
            ErrorKind::ContractViolation => "contract_violation",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Provider => "provider",
            ErrorKind::Config => "config",
        };
        f.write_str(s)
    }
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Transient(_) => ErrorKind::Transient,
            GatewayError::Auth(_) => ErrorKind::Auth,
            GatewayError::Billing(_) => ErrorKind::Billing,
            GatewayError::Timeout(_) => ErrorKind::Timeout,
            GatewayError::ToolFailure { .. } => ErrorKind::ToolFailure,
            GatewayError::QueueExhausted { .. } => ErrorKind::QueueExhausted,
            GatewayError::ContractViolation(_) => ErrorKind::ContractViolation,
            GatewayError::Cancelled => ErrorKind::Cancelled,
            GatewayError::Provider(_) => ErrorKind::Provider,
            GatewayError::Config(_) => ErrorKind::Config,
        }
    }

    /// 面向用户的简短说明：不含端点名、冷却时长等内部细节
    pub fn summary(&self) -> String {
        match self.kind() {
            ErrorKind::Transient => "All model providers are temporarily unavailable, please retry shortly.",
            ErrorKind::Auth => "The model provider rejected our credentials.",
            ErrorKind::Billing => "The model provider quota is exhausted.",
            ErrorKind::Timeout => "The request took too long and was stopped.",
            ErrorKind::ToolFailure => "A tool failed while handling the request.",
            ErrorKind::QueueExhausted => "The request could not be delivered and was given up.",
            ErrorKind::ContractViolation => "Internal consistency error.",
            ErrorKind::Cancelled => "The request was cancelled.",
            ErrorKind::Provider => "The model provider could not handle the request.",
            ErrorKind::Config => "The gateway is misconfigured.",
        }
        .to_string()
    }

    /// 转为可缓存、可多次投递的对外错误
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            kind: self.kind(),
            message: self.summary(),
        }
    }
}

/// 投递给适配器的错误载荷
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(GatewayError::Billing("quota".into()).kind(), ErrorKind::Billing);
        assert_eq!(
            GatewayError::QueueExhausted {
                destination: "providers".into(),
                attempts: 3
            }
            .kind(),
            ErrorKind::QueueExhausted
        );
    }

    #[test]
    fn test_payload_hides_internal_detail() {
        let err = GatewayError::Transient("openai:gpt-4o cooldown 300s".into());
        let payload = err.to_payload();
        assert_eq!(payload.kind, ErrorKind::Transient);
        assert!(!payload.message.contains("openai"));
        assert!(!payload.message.contains("300"));
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::QueueExhausted).unwrap();
        assert_eq!(json, "\"queue_exhausted\"");
    }
}
