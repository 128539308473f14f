//! 端点健康：失败分类、冷却策略、熔断账本

pub mod classifier;
pub mod ledger;
pub mod policy;

pub use classifier::{CallOutcome, FailureClass, FailureClassifier};
pub use ledger::{CircuitStatus, HealthLedger, HealthRecord, SelectionOrder};
pub use policy::{Cooldown, CooldownPolicy, CooldownScope, PolicyDecision, RetryAction};
