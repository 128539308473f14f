//! 失败分类：把提供方错误（状态码 + 文本）映射为健康账本使用的失败类别
//!
//! 计费短语优先：即便状态码是 429，只要错误文本命中计费词表，就按 BILLING 处理。
//! 词表来自配置（正则，大小写不敏感）。

use regex::{RegexSet, RegexSetBuilder};
use serde::Serialize;

use crate::config::ResilienceSection;
use crate::core::GatewayError;
use crate::llm::{ProviderError, ProviderErrorKind};

/// 影响端点健康的失败类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// 超时 / 5xx / 429
    Transient,
    /// 401 / 403
    Auth,
    /// 命中计费短语
    Billing,
}

impl FailureClass {
    /// 所有端点都因该类别失败时，请求以什么错误结束
    pub fn to_error(self, detail: impl Into<String>) -> GatewayError {
        match self {
            FailureClass::Transient => GatewayError::Transient(detail.into()),
            FailureClass::Auth => GatewayError::Auth(detail.into()),
            FailureClass::Billing => GatewayError::Billing(detail.into()),
        }
    }
}

/// 一次提供方调用的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure(FailureClass),
}

/// 可配置的失败分类器
#[derive(Debug, Clone)]
pub struct FailureClassifier {
    billing: RegexSet,
}

impl FailureClassifier {
    pub fn new<S: AsRef<str>>(billing_patterns: &[S]) -> Result<Self, GatewayError> {
        let billing = RegexSetBuilder::new(billing_patterns.iter().map(|p| p.as_ref()))
            .case_insensitive(true)
            .build()
            .map_err(|e| GatewayError::Config(format!("invalid billing pattern: {}", e)))?;
        Ok(Self { billing })
    }

    pub fn from_config(section: &ResilienceSection) -> Result<Self, GatewayError> {
        Self::new(&section.billing_patterns)
    }

    pub fn is_billing_text(&self, text: &str) -> bool {
        self.billing.is_match(text)
    }

    /// 返回 None 表示与端点健康无关的错误（OTHER，例如 400 请求格式错误）
    pub fn classify(&self, error: &ProviderError) -> Option<FailureClass> {
        if self.is_billing_text(&error.message) {
            return Some(FailureClass::Billing);
        }
        match error.kind {
            ProviderErrorKind::Transient => Some(FailureClass::Transient),
            ProviderErrorKind::Auth => Some(FailureClass::Auth),
            ProviderErrorKind::Billing => Some(FailureClass::Billing),
            ProviderErrorKind::Other => match error.status {
                Some(408) | Some(429) => Some(FailureClass::Transient),
                Some(s) if s >= 500 => Some(FailureClass::Transient),
                Some(401) | Some(403) => Some(FailureClass::Auth),
                _ => None,
            },
        }
    }
}

impl Default for FailureClassifier {
    fn default() -> Self {
        // 默认词表由配置默认值提供，编译期已知合法
        match Self::from_config(&ResilienceSection::default()) {
            Ok(c) => c,
            Err(_) => Self {
                billing: RegexSet::empty(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_phrase_beats_429() {
        let classifier = FailureClassifier::default();
        let err = ProviderError::from_status(
            429,
            r#"{"error":{"message":"You exceeded your current quota, please check your plan and billing details.","type":"insufficient_quota"}}"#,
        );
        assert_eq!(err.kind, ProviderErrorKind::Transient);
        assert_eq!(classifier.classify(&err), Some(FailureClass::Billing));
    }

    #[test]
    fn test_plain_429_is_transient() {
        let classifier = FailureClassifier::default();
        let err = ProviderError::from_status(429, "Rate limit reached for requests");
        assert_eq!(classifier.classify(&err), Some(FailureClass::Transient));
    }

    #[test]
    fn test_auth_and_other() {
        let classifier = FailureClassifier::default();
        assert_eq!(
            classifier.classify(&ProviderError::from_status(401, "invalid api key")),
            Some(FailureClass::Auth)
        );
        assert_eq!(
            classifier.classify(&ProviderError::from_status(400, "bad request")),
            None
        );
    }

    #[test]
    fn test_custom_vocabulary_is_case_insensitive() {
        let classifier = FailureClassifier::new(&["out of credits"]).unwrap();
        let err = ProviderError::transient("Account OUT OF CREDITS");
        assert_eq!(classifier.classify(&err), Some(FailureClass::Billing));
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let err = FailureClassifier::new(&["(unclosed"]).unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }
}
