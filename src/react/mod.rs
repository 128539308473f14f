//! 认知层：输出解析、反思、工具执行循环

pub mod critic;
pub mod events;
pub mod loop_;
pub mod planner;

pub use critic::{ProviderReflector, Reflector};
pub use events::LoopEvent;
pub use loop_::{LoopEventSender, LoopInput, LoopOutcome, ToolLoop};
pub use planner::{build_system_prompt, parse_model_output, PlannerOutput, ToolCall};
