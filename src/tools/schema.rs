//! 工具参数 Schema：schemars 生成 + 调用前的子集校验
//!
//! 校验只覆盖工具 schema 中实际用到的部分：顶层 object、required 字段、属性的基本类型。

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 工具调用格式 `{"tool": "...", "args": {...}}`（仅用于生成 Schema）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 已注册的工具名
    pub tool: String,
    /// 工具参数，结构见各工具的 parameters
    pub args: serde_json::Map<String, Value>,
}

/// 工具调用格式的 JSON Schema 字符串，可拼入 system prompt
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 由参数结构体生成 JSON Schema（工具的 parameters_schema 使用）
pub fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| serde_json::json!({ "type": "object" }))
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

/// schema 中的 "type" 可以是字符串或字符串数组（schemars 对 Option<T> 生成后者）
fn check_type(schema: &Value, value: &Value) -> bool {
    match schema.get("type") {
        Some(Value::String(t)) => type_matches(t, value),
        Some(Value::Array(types)) => types
            .iter()
            .filter_map(|t| t.as_str())
            .any(|t| type_matches(t, value)),
        _ => true,
    }
}

/// 按 schema 校验参数；返回面向模型的错误说明
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    if !check_type(schema, args) {
        return Err(format!("arguments must match type {}", schema["type"]));
    }

    let Some(obj) = args.as_object() else {
        return Ok(());
    };

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for field in required.iter().filter_map(|f| f.as_str()) {
            if !obj.contains_key(field) {
                return Err(format!("missing required field `{}`", field));
            }
        }
    }

    if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
        for (key, value) in obj {
            if let Some(prop_schema) = props.get(key) {
                if !check_type(prop_schema, value) {
                    return Err(format!(
                        "field `{}` must be of type {}",
                        key, prop_schema["type"]
                    ));
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[allow(dead_code)]
    #[derive(Deserialize, JsonSchema)]
    struct SampleArgs {
        path: String,
        limit: Option<u32>,
    }

    #[test]
    fn test_tool_call_schema_mentions_fields() {
        let s = tool_call_schema_json();
        assert!(s.contains("\"tool\""));
        assert!(s.contains("\"args\""));
    }

    #[test]
    fn test_validate_against_generated_schema() {
        let schema = schema_of::<SampleArgs>();
        assert!(validate_args(&schema, &json!({"path": "/tmp"})).is_ok());
        assert!(validate_args(&schema, &json!({"path": "/tmp", "limit": 3})).is_ok());
        assert!(validate_args(&schema, &json!({"path": "/tmp", "limit": null})).is_ok());

        let missing = validate_args(&schema, &json!({"limit": 3})).unwrap_err();
        assert!(missing.contains("path"));

        let wrong = validate_args(&schema, &json!({"path": 42})).unwrap_err();
        assert!(wrong.contains("path"));

        assert!(validate_args(&schema, &json!("not an object")).is_err());
    }
}
