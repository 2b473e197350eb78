//! Hive - 自主运行的 Rust 智能体
//!
//! 入口：初始化日志、加载配置、创建 AgentRuntime 并运行主循环。
//! Ctrl+C / SIGTERM 触发优雅关闭；后端重试耗尽时以非零码退出，交给外部监管者重启。

use std::sync::Arc;

use anyhow::Context;
use hive::config::{load_config, AppConfig};
use hive::core::{
    AgentRuntime, ProcessSessionCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason,
};

/// 把进程信号转成 ShutdownManager::shutdown
fn forward_signals(manager: Arc<ShutdownManager>) {
    let ctrl_c = manager.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.shutdown(ShutdownReason::UserInitiated);
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                if term.recv().await.is_some() {
                    manager.shutdown(ShutdownReason::Signal);
                }
            }
            Err(e) => tracing::warn!("Failed to install SIGTERM handler: {}", e),
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!("Failed to load config: {}, using defaults", e);
        AppConfig::default()
    });

    let shutdown = Arc::new(ShutdownManager::new());
    forward_signals(shutdown.clone());

    let mut runtime = AgentRuntime::from_config(&cfg, shutdown.clone())
        .await
        .context("Failed to create agent runtime")?;

    let mut coordinator = ShutdownCoordinator::new().with_timeout(cfg.process.grace_secs + 5);
    coordinator.register(ProcessSessionCleanup::new(runtime.processes().clone()));
    let mut reasons = shutdown.subscribe();

    let result = runtime.run().await;
    if let Err(e) = &result {
        shutdown.shutdown(ShutdownReason::FatalError(e.to_string()));
    }
    if let Ok(reason) = reasons.try_recv() {
        tracing::info!(reason = ?reason, "Agent stopping");
    }
    coordinator.run_cleanup().await;

    result.context("Agent runtime stopped")?;
    Ok(())
}
