//! OpenAI 兼容 Chat Completions 提供方
//!
//! 通过 reqwest 调用任意 OpenAI 兼容端点（DeepSeek、OpenAI、自建代理等），只做一件事：
//! 把 HTTP 响应翻译为文本或带类别的 ProviderError；计费短语的最终判定交给 FailureClassifier。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ProviderSection;
use crate::llm::{Message, Provider, ProviderEndpoint, ProviderError, Role};

/// 请求体中的单条消息
#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: std::borrow::Cow<'a, str>,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

fn to_wire(message: &Message) -> WireMessage<'_> {
    match message.role {
        Role::System => WireMessage {
            role: "system",
            content: message.content.as_str().into(),
        },
        Role::User => WireMessage {
            role: "user",
            content: message.content.as_str().into(),
        },
        Role::Assistant => WireMessage {
            role: "assistant",
            content: message.content.as_str().into(),
        },
        // 文本协议下没有 tool_call_id，工具结果以用户消息回填
        Role::Tool => WireMessage {
            role: "user",
            content: format!("Tool result:\n{}", message.content).into(),
        },
    }
}

/// OpenAI 兼容提供方：持有 HTTP 客户端、base_url 与可选 API Key
pub struct OpenAiCompatProvider {
    name: String,
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatProvider {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            name: name.into(),
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
        }
    }

    /// 从 [providers.<name>] 段创建；API Key 从 api_key_env 指定的环境变量读取
    pub fn from_config(name: &str, section: &ProviderSection) -> Self {
        let api_key = section
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok());
        if api_key.is_none() {
            tracing::warn!(provider = name, "No API key found for provider, requests will be unauthenticated");
        }
        Self::new(name, section.base_url.clone(), api_key)
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

fn map_transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ProviderError::transient(err.to_string())
    } else {
        ProviderError::other(err.to_string())
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        endpoint: &ProviderEndpoint,
        context: &[Message],
    ) -> Result<String, ProviderError> {
        let body = ChatRequest {
            model: &endpoint.model,
            messages: context.iter().map(to_wire).collect(),
        };

        let mut request = self.client.post(self.completions_url()).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();
        let text = response.text().await.map_err(map_transport_error)?;

        if !status.is_success() {
            return Err(ProviderError::from_status(status.as_u16(), text));
        }

        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| ProviderError::other(format!("invalid response JSON: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::other("response contained no choices"))
    }
}
