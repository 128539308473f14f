//! 提供方抽象
//!
//! 编排层只依赖一个契约：invoke(endpoint, context) 返回文本，或带类别的 ProviderError。
//! 具体后端（OpenAI 兼容 HTTP / 脚本化测试后端）实现 Provider，并按名称注册到 ProviderRegistry。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::llm::{Message, ProviderEndpoint};

/// 提供方自报的错误类别（最终分类以 FailureClassifier 为准）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Transient,
    Auth,
    Billing,
    Other,
}

/// 提供方调用失败：类别 + 可选 HTTP 状态 + 原始错误文本
#[derive(Debug, Clone, Error)]
#[error("{kind:?} provider error (status {status:?}): {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Transient, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Auth, message)
    }

    pub fn billing(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Billing, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Other, message)
    }

    /// 按 HTTP 状态码给出初步类别（401/403 鉴权，402 计费，408/429/5xx 短暂故障）
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let kind = match status {
            401 | 403 => ProviderErrorKind::Auth,
            402 => ProviderErrorKind::Billing,
            408 | 429 => ProviderErrorKind::Transient,
            s if s >= 500 => ProviderErrorKind::Transient,
            _ => ProviderErrorKind::Other,
        };
        Self::new(kind, body).with_status(status)
    }
}

/// 提供方 trait：对某端点发送上下文，返回模型输出文本
#[async_trait]
pub trait Provider: Send + Sync {
    /// 提供方名称（与 ProviderEndpoint.provider 对应）
    fn name(&self) -> &str;

    async fn invoke(
        &self,
        endpoint: &ProviderEndpoint,
        context: &[Message],
    ) -> Result<String, ProviderError>;
}

/// 提供方注册表：按名称存储 Arc<dyn Provider>
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: impl Provider + 'static) {
        let name = provider.name().to_string();
        self.providers.insert(name, Arc::new(provider));
    }

    pub fn register_arc(&mut self, provider: Arc<dyn Provider>) {
        let name = provider.name().to_string();
        self.providers.insert(name, provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
