//! 核心：错误分类、请求阶段、优雅关闭

pub mod error;
pub mod shutdown;
pub mod state;

pub use error::{ErrorKind, ErrorPayload, GatewayError};
pub use shutdown::{CleanupReport, ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
pub use state::RequestPhase;
