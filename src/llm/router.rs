//! 意图分档：根据对话内容推断请求需要的模型档位
//!
//! - 简单问答：cheap 档，快速轻量模型
//! - 摘要、工具决策、一般请求：standard 档
//! - 代码生成、复杂推理：complex 档
//!
//! 分档只决定初始偏好，不是硬性要求；调用方可通过 IntentClassifier trait 替换启发式。

use crate::llm::{CostTier, Message, Role};

/// 任务类型（分档的中间结果）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    /// 简单问答/闲聊
    SimpleChat,
    /// 代码生成/编辑
    CodeGeneration,
    /// 复杂推理/分析
    ComplexReasoning,
    /// 上下文中已有工具结果
    ToolDecision,
    Summarization,
    Default,
}

impl TaskType {
    pub fn tier(self) -> CostTier {
        match self {
            TaskType::SimpleChat => CostTier::Cheap,
            TaskType::Summarization | TaskType::ToolDecision | TaskType::Default => {
                CostTier::Standard
            }
            TaskType::CodeGeneration | TaskType::ComplexReasoning => CostTier::Complex,
        }
    }
}

/// 可替换的分档器
pub trait IntentClassifier: Send + Sync {
    fn classify(&self, messages: &[Message]) -> CostTier;
}

/// 一条关键词规则：命中任一关键词即判为对应任务类型
#[derive(Debug, Clone)]
pub struct KeywordRule {
    pub task: TaskType,
    pub keywords: Vec<String>,
}

impl KeywordRule {
    pub fn new(task: TaskType, keywords: &[&str]) -> Self {
        Self {
            task,
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
        }
    }

    fn matches(&self, lowered: &str) -> bool {
        self.keywords.iter().any(|k| lowered.contains(k.as_str()))
    }
}

/// 关键词启发式分档器：规则按顺序匹配最后一条用户消息，先命中者生效
#[derive(Debug, Clone)]
pub struct TaskClassifier {
    rules: Vec<KeywordRule>,
    /// 短于此字符数且未命中规则的消息视为闲聊
    short_message_chars: usize,
}

impl Default for TaskClassifier {
    fn default() -> Self {
        Self {
            rules: vec![
                KeywordRule::new(
                    TaskType::CodeGeneration,
                    &[
                        "代码", "编程", "函数", "bug", "compile", "rust", "python", "typescript",
                        "implement", "refactor", "debug", "写一个", "function", "struct", "trait",
                    ],
                ),
                KeywordRule::new(
                    TaskType::ComplexReasoning,
                    &[
                        "分析", "推理", "为什么", "analyze", "explain", "why", "compare",
                        "evaluate", "比较", "评估", "plan", "规划",
                    ],
                ),
                KeywordRule::new(
                    TaskType::Summarization,
                    &["总结", "摘要", "概括", "summarize", "summary", "tldr"],
                ),
            ],
            short_message_chars: 100,
        }
    }
}

impl TaskClassifier {
    pub fn new(rules: Vec<KeywordRule>) -> Self {
        Self {
            rules,
            ..Self::default()
        }
    }

    /// 追加一条规则（优先级低于已有规则）
    pub fn with_rule(mut self, rule: KeywordRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_short_message_chars(mut self, chars: usize) -> Self {
        self.short_message_chars = chars;
        self
    }

    pub fn task_type(&self, messages: &[Message]) -> TaskType {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map_or("", |m| m.content.as_str());
        let lowered = last_user.to_lowercase();

        if let Some(rule) = self.rules.iter().find(|r| r.matches(&lowered)) {
            return rule.task;
        }
        if messages.iter().any(|m| m.role == Role::Tool) {
            return TaskType::ToolDecision;
        }
        // 按字符数，中文不按字节算
        if last_user.chars().count() < self.short_message_chars {
            TaskType::SimpleChat
        } else {
            TaskType::Default
        }
    }
}

impl IntentClassifier for TaskClassifier {
    fn classify(&self, messages: &[Message]) -> CostTier {
        self.task_type(messages).tier()
    }
}
