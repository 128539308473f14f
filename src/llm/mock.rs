//! 脚本化提供方（用于测试与无 API Key 时的本地演示）
//!
//! 每个模型维护一个按顺序消费的脚本（回复 / 失败）；脚本耗尽后回显最后一条用户消息。
//! 记录每次调用的端点，便于断言「只执行了一次」「没有降档」等性质。

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::llm::{EndpointId, Message, Provider, ProviderEndpoint, ProviderError, Role};

/// 单步脚本
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Reply(String),
    Fail(ProviderError),
}

/// 脚本化提供方
pub struct ScriptedProvider {
    name: String,
    scripts: Mutex<HashMap<String, VecDeque<ScriptStep>>>,
    calls: Mutex<Vec<EndpointId>>,
    latency: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            latency: None,
        }
    }

    /// 每次调用前等待固定时长（模拟慢提供方）
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_reply(self, model: &str, text: impl Into<String>) -> Self {
        self.push(model, ScriptStep::Reply(text.into()));
        self
    }

    pub fn with_failure(self, model: &str, error: ProviderError) -> Self {
        self.push(model, ScriptStep::Fail(error));
        self
    }

    /// 运行期追加脚本
    pub fn push(&self, model: &str, step: ScriptStep) {
        self.scripts
            .lock()
            .entry(model.to_string())
            .or_default()
            .push_back(step);
    }

    /// 所有调用过的端点（按调用顺序）
    pub fn calls(&self) -> Vec<EndpointId> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        endpoint: &ProviderEndpoint,
        context: &[Message],
    ) -> Result<String, ProviderError> {
        self.calls.lock().push(endpoint.id());

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let step = self
            .scripts
            .lock()
            .get_mut(&endpoint.model)
            .and_then(|q| q.pop_front());

        match step {
            Some(ScriptStep::Reply(text)) => Ok(text),
            Some(ScriptStep::Fail(err)) => Err(err),
            None => {
                let last_user = context
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.as_str())
                    .unwrap_or("(no input)");
                Ok(format!("Echo from {}: {}", endpoint.model, last_user))
            }
        }
    }
}
