//! 工具执行器
//!
//! execute(tool_name, args)：查找工具 → 按 schema 校验参数 → 在工具声明（或默认）的超时内执行；
//! 每次调用输出一条 JSON 审计日志。

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{timeout, Instant};

use crate::tools::{validate_args, ToolError, ToolRegistry};

/// 工具执行器：持有注册表与默认超时
#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    default_timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, default_timeout: Duration) -> Self {
        Self {
            registry: Arc::new(registry),
            default_timeout,
        }
    }

    pub async fn execute(&self, tool_name: &str, args: serde_json::Value) -> Result<String, ToolError> {
        let start = Instant::now();
        let args_preview = args_preview(&args);

        let result = self.run(tool_name, args).await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(ToolError::UnknownTool(_)) => "unknown_tool",
            Err(ToolError::InvalidArgs { .. }) => "invalid_args",
            Err(ToolError::Timeout { .. }) => "timeout",
            Err(ToolError::Failed { .. }) => "error",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit, "tool");

        result
    }

    async fn run(&self, tool_name: &str, args: serde_json::Value) -> Result<String, ToolError> {
        let tool = self
            .registry
            .get(tool_name)
            .ok_or_else(|| ToolError::UnknownTool(tool_name.to_string()))?;

        validate_args(&tool.parameters_schema(), &args).map_err(|reason| ToolError::InvalidArgs {
            tool: tool_name.to_string(),
            reason,
        })?;

        let limit = tool.timeout().unwrap_or(self.default_timeout);
        match timeout(limit, tool.execute(args)).await {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(reason)) => Err(ToolError::Failed {
                tool: tool_name.to_string(),
                reason,
            }),
            Err(_) => Err(ToolError::Timeout {
                tool: tool_name.to_string(),
                timeout_ms: limit.as_millis() as u64,
            }),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{EchoTool, Tool};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "sleeps for a minute"
        }

        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_millis(50))
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("done".into())
        }
    }

    struct BrokenTool;

    #[async_trait]
    impl Tool for BrokenTool {
        fn name(&self) -> &str {
            "broken"
        }

        fn description(&self) -> &str {
            "always fails"
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            Err("disk on fire".into())
        }
    }

    fn executor() -> ToolExecutor {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(SlowTool);
        registry.register(BrokenTool);
        ToolExecutor::new(registry, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_execute_ok() {
        let out = executor().execute("echo", json!({"text": "hi"})).await.unwrap();
        assert_eq!(out, "hi");
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let err = executor().execute("nope", json!({})).await.unwrap_err();
        assert_eq!(err, ToolError::UnknownTool("nope".into()));
    }

    #[tokio::test]
    async fn test_schema_violation_is_rejected_before_execution() {
        let err = executor().execute("echo", json!({"text": 5})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgs { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_declared_timeout_applies() {
        let err = executor().execute("slow", json!({})).await.unwrap_err();
        assert_eq!(
            err,
            ToolError::Timeout {
                tool: "slow".into(),
                timeout_ms: 50
            }
        );
    }

    #[tokio::test]
    async fn test_tool_error_is_wrapped() {
        let err = executor().execute("broken", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::Failed { reason, .. } if reason == "disk on fire"));
    }
}
