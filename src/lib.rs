//! Switchboard - 个人 LLM 网关的请求编排与容错层
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、请求阶段、优雅关闭
//! - **gateway**: 幂等缓存、输入防抖、离线队列与编排运行时
//! - **health**: 失败分类、冷却策略、熔断账本
//! - **llm**: 提供方抽象与实现（OpenAI 兼容 / 脚本化）、端点、意图分档
//! - **observability**: tracing 初始化与内部事件总线
//! - **react**: 输出解析、反思、工具执行循环
//! - **tools**: Tool trait、注册表、执行器与内置工具

pub mod config;
pub mod core;
pub mod gateway;
pub mod health;
pub mod llm;
pub mod observability;
pub mod react;
pub mod tools;

pub use gateway::{EventStream, GatewayEvent, Orchestrator, Request};
