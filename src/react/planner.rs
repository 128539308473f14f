//! 模型输出解析与系统提示词拼装
//!
//! parse_model_output 从文本中提取 JSON：`{"tool": "...", "args": {...}}` 为工具调用，
//! 其余文本为最终回复；看起来是工具调用但 JSON 不合法时返回 Malformed，由循环要求模型重写。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::{tool_call_schema_json, ToolRegistry};

fn empty_args() -> Value {
    Value::Object(serde_json::Map::new())
}

/// 模型请求的工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default = "empty_args")]
    pub args: Value,
}

/// 解析结果
#[derive(Debug, Clone, PartialEq)]
pub enum PlannerOutput {
    /// 最终回复
    Final(String),
    ToolCall(ToolCall),
    /// 形似工具调用但无法解析（附原因）
    Malformed(String),
}

/// 提取 ```json 代码块，或以 `{` 开头、`}` 结尾的整段文本
fn extract_json(trimmed: &str) -> Option<&str> {
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    if trimmed.starts_with('{') {
        let end = trimmed.rfind('}')?;
        return Some(&trimmed[..=end]);
    }
    None
}

pub fn parse_model_output(output: &str) -> PlannerOutput {
    let trimmed = output.trim();

    let Some(json_str) = extract_json(trimmed) else {
        return PlannerOutput::Final(trimmed.to_string());
    };

    let value: Value = match serde_json::from_str(json_str) {
        Ok(v) => v,
        Err(e) => return PlannerOutput::Malformed(format!("invalid JSON: {}", e)),
    };

    // 没有 tool 字段的 JSON 是模型直接给出的结构化回答
    if value.get("tool").is_none() {
        return PlannerOutput::Final(trimmed.to_string());
    }

    match serde_json::from_value::<ToolCall>(value) {
        Ok(mut call) => {
            if call.tool.trim().is_empty() {
                return PlannerOutput::Final(trimmed.to_string());
            }
            if call.args.is_null() {
                call.args = empty_args();
            }
            PlannerOutput::ToolCall(call)
        }
        Err(e) => PlannerOutput::Malformed(format!("invalid tool call: {}", e)),
    }
}

/// 基础提示词 + 工具调用格式 + 已注册工具清单
pub fn build_system_prompt(base: &str, tools: &ToolRegistry) -> String {
    if tools.is_empty() {
        return base.to_string();
    }
    format!(
        "{}\n\nTool call format (JSON Schema):\n{}\n\nAvailable tools:\n{}",
        base,
        tool_call_schema_json(),
        tools.to_schema_json()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_text_is_final() {
        assert_eq!(
            parse_model_output("  The answer is 4.  "),
            PlannerOutput::Final("The answer is 4.".into())
        );
    }

    #[test]
    fn test_bare_json_tool_call() {
        let out = parse_model_output(r#"{"tool": "echo", "args": {"text": "hi"}}"#);
        assert_eq!(
            out,
            PlannerOutput::ToolCall(ToolCall {
                tool: "echo".into(),
                args: json!({"text": "hi"})
            })
        );
    }

    #[test]
    fn test_fenced_tool_call_without_args() {
        let out = parse_model_output("Let me check.\n```json\n{\"tool\": \"clock\"}\n```");
        assert_eq!(
            out,
            PlannerOutput::ToolCall(ToolCall {
                tool: "clock".into(),
                args: json!({})
            })
        );
    }

    #[test]
    fn test_prose_with_braces_is_final() {
        let text = "Use a struct like Point { x, y } here.";
        assert_eq!(parse_model_output(text), PlannerOutput::Final(text.into()));
    }

    #[test]
    fn test_broken_json_is_malformed() {
        assert!(matches!(
            parse_model_output(r#"{"tool": "echo", "args": "#),
            PlannerOutput::Malformed(_)
        ));
    }

    #[test]
    fn test_json_without_tool_is_final() {
        let text = r#"{"answer": 42}"#;
        assert_eq!(parse_model_output(text), PlannerOutput::Final(text.into()));
    }

    #[test]
    fn test_system_prompt_lists_tools() {
        let mut registry = ToolRegistry::new();
        registry.register(crate::tools::EchoTool);
        let prompt = build_system_prompt("base", &registry);
        assert!(prompt.starts_with("base"));
        assert!(prompt.contains("\"echo\""));
        assert_eq!(build_system_prompt("base", &ToolRegistry::new()), "base");
    }
}
