//! Clock 工具：返回当前 UTC 时间（可选小时偏移）

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::{schema_of, Tool};

#[derive(Debug, Default, Deserialize, JsonSchema)]
struct ClockArgs {
    /// 相对 UTC 的小时偏移，如 8 表示 UTC+8
    #[serde(default)]
    offset_hours: Option<i64>,
}

pub struct ClockTool;

#[async_trait]
impl Tool for ClockTool {
    fn name(&self) -> &str {
        "clock"
    }

    fn description(&self) -> &str {
        "Current date and time. Args: {\"offset_hours\": 8} (optional)"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<ClockArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: ClockArgs = if args.is_null() {
            ClockArgs::default()
        } else {
            serde_json::from_value(args).map_err(|e| e.to_string())?
        };
        let offset = args.offset_hours.unwrap_or(0);
        if !(-12..=14).contains(&offset) {
            return Err(format!("offset_hours out of range: {}", offset));
        }
        let now = Utc::now() + ChronoDuration::hours(offset);
        Ok(format!("{} (UTC{:+})", now.format("%Y-%m-%d %H:%M:%S"), offset))
    }
}
