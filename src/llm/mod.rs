//! LLM 层：消息、端点、提供方抽象与实现（OpenAI 兼容 / 脚本化），以及意图分档

pub mod endpoint;
pub mod message;
pub mod mock;
pub mod openai;
pub mod router;
pub mod traits;

pub use endpoint::{CostTier, EndpointId, ProviderEndpoint};
pub use message::{Message, Role};
pub use mock::{ScriptStep, ScriptedProvider};
pub use openai::OpenAiCompatProvider;
pub use router::{IntentClassifier, KeywordRule, TaskClassifier, TaskType};
pub use traits::{Provider, ProviderError, ProviderErrorKind, ProviderRegistry};
