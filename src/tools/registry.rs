//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry
//! 按名注册与查找；ToolExecutor 负责参数校验、超时与审计。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::core::GatewayError;

/// 工具 trait：名称、描述（供模型理解）、参数 schema、可选超时、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（JSON 中的 "tool" 字段）
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认接受任意对象
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 工具自己声明的超时；None 时使用执行器的默认值
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 工具调用失败
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments for {tool}: {reason}")]
    InvalidArgs { tool: String, reason: String },

    #[error("Tool {tool} timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    #[error("Tool {tool} failed: {reason}")]
    Failed { tool: String, reason: String },
}

impl From<ToolError> for GatewayError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::UnknownTool(tool) => GatewayError::ToolFailure {
                tool,
                reason: "unknown tool".to_string(),
            },
            ToolError::InvalidArgs { tool, reason } | ToolError::Failed { tool, reason } => {
                GatewayError::ToolFailure { tool, reason }
            }
            ToolError::Timeout { tool, timeout_ms } => {
                GatewayError::Timeout(format!("tool {} after {}ms", tool, timeout_ms))
            }
        }
    }
}

/// 工具注册表：按名称存储 Arc<dyn Tool>（有序，生成的 prompt 稳定）
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 工具清单 JSON（name / description / parameters），拼入 system prompt
    pub fn to_schema_json(&self) -> String {
        let tools: Vec<Value> = self
            .tools
            .iter()
            .map(|(name, tool)| {
                serde_json::json!({
                    "name": name,
                    "description": tool.description(),
                    "parameters": tool.parameters_schema()
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}
