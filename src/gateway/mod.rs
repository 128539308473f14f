//! 网关编排层
//!
//! 适配器只看到 `Orchestrator::submit(Request) -> EventStream`；其余都是内部组件：
//!
//! - **cache**：按客户端请求 ID 的幂等缓存（进行中 / 已完成），带 TTL 与后台清扫
//! - **debounce**：按会话的输入防抖，窗口静默后合并为一个逻辑请求
//! - **task_queue**：目的地不可达时的离线队列，分级退避，耗尽转死信
//! - **runtime**：组合根，驱动工具循环并把过程翻译为事件流

mod cache;
mod debounce;
mod message;
mod runtime;
mod task_queue;

pub use cache::{Admission, CacheKey, CacheState, CachedOutcome, CompletionWaiter, PendingGuard, ResponseCache};
pub use debounce::{Batch, Debouncer};
pub use message::{EventStream, GatewayEvent, Request};
pub use runtime::{DeferredRequest, Orchestrator, OrchestratorSettings, PROVIDERS_DESTINATION};
pub use task_queue::{DeadLetter, DeliveryError, Destination, DrainReport, OfflineQueue, QueueItem};
