//! 优雅关闭
//!
//! 核心不安装任何进程级信号处理器：由外层（main 或进程监管者）调用 `ShutdownManager::shutdown`。
//! 关闭后 ShutdownCoordinator 依次执行已注册的清理任务，每个任务有超时。

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::process::ProcessSessionManager;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// 用户发起（Ctrl+C）
    UserInitiated,
    /// 进程监管者发来的终止信号
    Signal,
    /// 致命错误
    FatalError(String),
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(4);
        Self {
            shutdown_token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 触发关闭；重复调用只有第一次的原因会被广播
    pub fn shutdown(&self, reason: ShutdownReason) {
        if self.shutdown_token.is_cancelled() {
            return;
        }
        tracing::info!(reason = ?reason, "Shutdown requested");
        let _ = self.reason_tx.send(reason);
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// 订阅关闭原因
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 清理任务名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 关闭协调器：管理多个清理任务
pub struct ShutdownCoordinator {
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    /// 单个清理任务的超时（秒）
    timeout_secs: u64,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            cleanup_tasks: Vec::new(),
            timeout_secs: 5,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    /// 执行所有清理任务
    pub async fn run_cleanup(&self) {
        tracing::info!("Running {} cleanup tasks...", self.cleanup_tasks.len());

        let timeout = tokio::time::Duration::from_secs(self.timeout_secs);

        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!("Cleanup task '{}' completed successfully", name);
                }
                Ok(Err(e)) => {
                    tracing::warn!("Cleanup task '{}' failed: {}", name, e);
                }
                Err(_) => {
                    tracing::warn!("Cleanup task '{}' timed out after {}s", name, self.timeout_secs);
                }
            }
        }

        tracing::info!("All cleanup tasks finished");
    }
}

/// 进程会话清理：终止所有运行中的命令并写盘
pub struct ProcessSessionCleanup {
    manager: ProcessSessionManager,
}

impl ProcessSessionCleanup {
    pub fn new(manager: ProcessSessionManager) -> Self {
        Self { manager }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for ProcessSessionCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.manager.shutdown_all().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ProcessSessions"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_wait_for_shutdown_wakes_all_waiters() {
        let manager = Arc::new(ShutdownManager::new());
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.wait_for_shutdown().await })
        };
        manager.shutdown(ShutdownReason::FatalError("backend down".into()));
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_shutdown_broadcasts_first_reason_once() {
        let manager = ShutdownManager::new();
        let mut reasons = manager.subscribe();
        assert!(!manager.is_shutdown());

        manager.shutdown(ShutdownReason::Signal);
        manager.shutdown(ShutdownReason::UserInitiated);
        assert!(manager.is_shutdown());
        assert_eq!(reasons.try_recv().unwrap(), ShutdownReason::Signal);
        assert!(reasons.try_recv().is_err());
    }

    struct MockCleanup {
        called: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl ShutdownCleanup for MockCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.called.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "MockCleanup"
        }
    }

    struct Stuck;

    #[async_trait::async_trait]
    impl ShutdownCleanup for Stuck {
        async fn cleanup(&self) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Stuck"
        }
    }

    #[tokio::test]
    async fn test_coordinator_runs_tasks_past_a_stuck_one() {
        let mut coordinator = ShutdownCoordinator::new().with_timeout(1);
        let called = Arc::new(AtomicBool::new(false));
        coordinator.register(Stuck);
        coordinator.register(MockCleanup {
            called: called.clone(),
        });

        coordinator.run_cleanup().await;
        assert!(called.load(Ordering::SeqCst));
    }
}
