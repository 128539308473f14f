//! 优雅关闭
//!
//! 后台任务（缓存清扫、离线队列、防抖批次、派发）都挂在同一个 token 上；
//! 每个逻辑请求的取消 token 是它的子 token，关闭时一并取消。
//! 关闭原因只记录第一次。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C 或输入流结束
    UserInitiated,
    /// SIGTERM
    Signal,
    FatalError(String),
}

/// 关闭信号管理器
#[derive(Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Arc<Mutex<Option<ShutdownReason>>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 随关闭一起取消的子 token
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        {
            let mut slot = self.reason.lock();
            if slot.is_none() {
                tracing::info!(reason = ?reason, "Shutdown requested");
                *slot = Some(reason);
            }
        }
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().clone()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// Ctrl+C 与（unix 上的）SIGTERM 都触发关闭
    pub fn install_signal_handlers(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            let terminate = async {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "SIGTERM handler unavailable");
                        std::future::pending::<()>().await;
                    }
                }
            };
            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    if res.is_ok() {
                        manager.shutdown(ShutdownReason::UserInitiated);
                    }
                }
                _ = terminate => manager.shutdown(ShutdownReason::Signal),
                _ = manager.wait_for_shutdown() => {}
            }
        });
    }
}

/// 关闭时执行的清理
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

/// 一轮清理的结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub completed: Vec<&'static str>,
    pub failed: Vec<&'static str>,
    pub timed_out: Vec<&'static str>,
}

/// 关闭协调器：按注册顺序执行清理，单项失败或超时不影响后续
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    tasks: Vec<Arc<dyn ShutdownCleanup>>,
    per_task_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            tasks: Vec::new(),
            per_task_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.per_task_timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.tasks.push(Arc::new(task));
    }

    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }

    pub async fn run_cleanup(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        for task in &self.tasks {
            let name = task.name();
            match tokio::time::timeout(self.per_task_timeout, task.cleanup()).await {
                Ok(Ok(())) => report.completed.push(name),
                Ok(Err(e)) => {
                    tracing::warn!(task = name, error = %e, "Cleanup failed");
                    report.failed.push(name);
                }
                Err(_) => {
                    tracing::warn!(task = name, timeout_ms = self.per_task_timeout.as_millis() as u64, "Cleanup timed out");
                    report.timed_out.push(name);
                }
            }
        }
        tracing::info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            timed_out = report.timed_out.len(),
            reason = ?self.manager.reason(),
            "Cleanup finished"
        );
        report
    }
}

/// 运行 app 直到其结束或收到关闭信号，随后取消后台任务并执行清理
pub async fn run_with_graceful_shutdown<F>(app: F, coordinator: &ShutdownCoordinator) -> CleanupReport
where
    F: Future<Output = ()>,
{
    let manager = Arc::clone(coordinator.manager());
    manager.install_signal_handlers();

    tokio::select! {
        _ = app => tracing::info!("Input finished"),
        _ = manager.wait_for_shutdown() => {}
    }
    manager.shutdown(ShutdownReason::UserInitiated);

    coordinator.run_cleanup().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_first_reason_wins_and_children_cancel() {
        let manager = ShutdownManager::new();
        let child = manager.child_token();
        manager.shutdown(ShutdownReason::Signal);
        manager.shutdown(ShutdownReason::UserInitiated);
        assert!(child.is_cancelled());
        assert!(manager.is_shutdown());
        assert_eq!(manager.reason(), Some(ShutdownReason::Signal));
    }

    struct Flag(Arc<AtomicBool>);

    #[async_trait::async_trait]
    impl ShutdownCleanup for Flag {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "flag"
        }
    }

    struct Broken;

    #[async_trait::async_trait]
    impl ShutdownCleanup for Broken {
        async fn cleanup(&self) -> anyhow::Result<()> {
            anyhow::bail!("queue report failed")
        }

        fn name(&self) -> &'static str {
            "broken"
        }
    }

    struct Stuck;

    #[async_trait::async_trait]
    impl ShutdownCleanup for Stuck {
        async fn cleanup(&self) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "stuck"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_continues_past_failures_and_timeouts() {
        let manager = Arc::new(ShutdownManager::new());
        let mut coordinator = ShutdownCoordinator::new(manager).with_timeout(Duration::from_secs(1));
        let called = Arc::new(AtomicBool::new(false));
        coordinator.register(Broken);
        coordinator.register(Stuck);
        coordinator.register(Flag(called.clone()));

        let report = coordinator.run_cleanup().await;
        assert!(called.load(Ordering::SeqCst));
        assert_eq!(report.completed, vec!["flag"]);
        assert_eq!(report.failed, vec!["broken"]);
        assert_eq!(report.timed_out, vec!["stuck"]);
    }

    #[tokio::test]
    async fn test_finished_app_triggers_shutdown_and_cleanup() {
        let manager = Arc::new(ShutdownManager::new());
        let token = manager.token();
        let coordinator = ShutdownCoordinator::new(manager);
        let report = run_with_graceful_shutdown(async {}, &coordinator).await;
        assert!(token.is_cancelled());
        assert_eq!(report, CleanupReport::default());
    }
}
