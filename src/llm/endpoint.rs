//! 端点定义：(provider, model) 对、成本档位、能力标签
//!
//! 端点来自静态配置，运行期只读。

use serde::{Deserialize, Serialize};

/// 成本档位，同时也是意图档位（cheap < standard < complex）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostTier {
    Cheap,
    Standard,
    Complex,
}

impl CostTier {
    pub const ALL: [CostTier; 3] = [CostTier::Cheap, CostTier::Standard, CostTier::Complex];

    /// 从 preferred 出发的档位搜索顺序：先本档，再逐级向上；不向下回退
    pub fn search_order(preferred: CostTier) -> Vec<CostTier> {
        Self::ALL.iter().copied().filter(|t| *t >= preferred).collect()
    }
}

impl std::fmt::Display for CostTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CostTier::Cheap => write!(f, "cheap"),
            CostTier::Standard => write!(f, "standard"),
            CostTier::Complex => write!(f, "complex"),
        }
    }
}

/// 端点唯一标识：`provider:model`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(provider: &str, model: &str) -> Self {
        Self(format!("{}:{}", provider, model))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 可调用的推理端点
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    pub provider: String,
    pub model: String,
    pub cost_tier: CostTier,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl ProviderEndpoint {
    pub fn new(provider: impl Into<String>, model: impl Into<String>, cost_tier: CostTier) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            cost_tier,
            capabilities: Vec::new(),
        }
    }

    pub fn with_capability(mut self, tag: impl Into<String>) -> Self {
        self.capabilities.push(tag.into());
        self
    }

    pub fn id(&self) -> EndpointId {
        EndpointId::new(&self.provider, &self.model)
    }

    /// 请求中的模型提示可以是 `provider:model` 或单独的 model 名
    pub fn matches_hint(&self, hint: &str) -> bool {
        let hint = hint.trim();
        hint == self.model || hint == self.id().as_str()
    }
}
