//! 工具箱：Tool trait、注册表、执行器与内置工具

pub mod clock;
pub mod echo;
pub mod executor;
pub mod registry;
pub mod schema;

pub use clock::ClockTool;
pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use registry::{Tool, ToolError, ToolRegistry};
pub use schema::{schema_of, tool_call_schema_json, validate_args};
