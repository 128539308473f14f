//! 反思：在返回前让模型复查一次草稿答案
//!
//! 模型回复 OK（或空）表示草稿可用，否则回复即为改进后的答案。
//! 反思失败不影响请求：循环会直接返回未经反思的草稿。

use async_trait::async_trait;

use crate::llm::{Message, Provider, ProviderEndpoint, ProviderError};

const DEFAULT_TEMPLATE: &str = "Review the draft answer to the user's request. \
If it is correct and complete reply with exactly OK. Otherwise reply with the improved answer only.\n\n\
Request:\n{goal}\n\nDraft answer:\n{draft}";

/// 可替换的反思器
#[async_trait]
pub trait Reflector: Send + Sync {
    async fn reflect(
        &self,
        goal: &str,
        draft: &str,
        provider: &dyn Provider,
        endpoint: &ProviderEndpoint,
    ) -> Result<String, ProviderError>;
}

/// 用同一提供方做一次复查调用
pub struct ProviderReflector {
    prompt_template: String,
}

impl Default for ProviderReflector {
    fn default() -> Self {
        Self::new(DEFAULT_TEMPLATE)
    }
}

impl ProviderReflector {
    pub fn new(prompt_template: impl Into<String>) -> Self {
        Self {
            prompt_template: prompt_template.into(),
        }
    }

    fn prompt(&self, goal: &str, draft: &str) -> String {
        self.prompt_template
            .replace("{goal}", goal)
            .replace("{draft}", draft)
    }
}

#[async_trait]
impl Reflector for ProviderReflector {
    async fn reflect(
        &self,
        goal: &str,
        draft: &str,
        provider: &dyn Provider,
        endpoint: &ProviderEndpoint,
    ) -> Result<String, ProviderError> {
        let messages = vec![Message::user(self.prompt(goal, draft))];
        let response = provider.invoke(endpoint, &messages).await?;
        let trimmed = response.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("ok") {
            Ok(draft.to_string())
        } else {
            Ok(trimmed.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CostTier, ScriptedProvider};

    #[tokio::test]
    async fn test_ok_keeps_draft_and_other_replaces_it() {
        let provider = ScriptedProvider::new("mock")
            .with_reply("m", "OK")
            .with_reply("m", "A better answer");
        let ep = ProviderEndpoint::new("mock", "m", CostTier::Standard);
        let reflector = ProviderReflector::default();

        let kept = reflector.reflect("q", "draft", &provider, &ep).await.unwrap();
        assert_eq!(kept, "draft");
        let replaced = reflector.reflect("q", "draft", &provider, &ep).await.unwrap();
        assert_eq!(replaced, "A better answer");
    }

    #[test]
    fn test_prompt_substitution() {
        let r = ProviderReflector::new("{goal} => {draft}");
        assert_eq!(r.prompt("2+2", "4"), "2+2 => 4");
    }
}
