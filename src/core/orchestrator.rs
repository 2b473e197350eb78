//! Agent 编排器：主控循环
//!
//! 负责：按配置创建推理后端、进程会话管理器、工具注册表、Transcript 存储与回合引擎，
//! 从存储恢复对话，然后循环 run_turn -> WakePolicy -> sleep，直到关闭 token 触发。
//! 后端重试耗尽时把错误返回给 main（进程以非零码退出，由外部监管者重启）。

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::config::AppConfig;
use crate::core::{AgentError, ShutdownManager};
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::memory::JsonlTranscriptStore;
use crate::process::{ProcessConfig, ProcessSessionManager};
use crate::react::{
    AdaptiveWake, ContextManager, RetryPolicy, StaticPreamble, TurnEngine, WakePolicy,
};
use crate::tools::{PluginTool, ProcessTool, ToolExecutor, ToolRegistry};

/// 根据配置与环境变量选择推理后端（OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &AppConfig) -> Result<Arc<dyn LlmClient>, AgentError> {
    let provider = cfg.llm.provider.to_lowercase();
    if provider == "mock" {
        tracing::info!("Using Mock LLM (configured)");
        return Ok(Arc::new(MockLlmClient::new()));
    }
    if provider != "openai" {
        return Err(AgentError::Config(format!(
            "unknown llm provider '{}' (expected openai or mock)",
            cfg.llm.provider
        )));
    }
    match std::env::var(&cfg.llm.api_key_env) {
        Ok(key) if !key.trim().is_empty() => {
            tracing::info!(
                model = %cfg.llm.model,
                base_url = cfg.llm.base_url.as_deref().unwrap_or(crate::llm::openai::OPENAI_BASE_URL),
                "Using OpenAI-compatible LLM"
            );
            let client = OpenAiClient::new(
                cfg.llm.base_url.as_deref(),
                &cfg.llm.model,
                &key,
                cfg.llm.request_timeout_secs,
            )
            .map_err(|e| AgentError::Config(e.to_string()))?;
            Ok(Arc::new(client))
        }
        _ => {
            tracing::warn!(
                env = %cfg.llm.api_key_env,
                "No API key set, using Mock LLM"
            );
            Ok(Arc::new(MockLlmClient::new()))
        }
    }
}

/// 前台命令超时上限：给 SIGTERM 宽限期和结果回传留出余量，保证先于工具调用超时结束
fn foreground_limit(cfg: &AppConfig) -> Duration {
    let margin = cfg.process.grace_secs + 5;
    Duration::from_secs(cfg.engine.tool_timeout_secs.saturating_sub(margin))
}

/// 内置 process 工具 + 配置中的外部插件
pub fn build_registry(
    cfg: &AppConfig,
    processes: &ProcessSessionManager,
    workspace: &Path,
) -> Result<ToolRegistry, AgentError> {
    let mut registry = ToolRegistry::new();
    registry
        .register(
            ProcessTool::new(processes.clone()).with_foreground_limit(foreground_limit(cfg)),
        )
        .map_err(|e| AgentError::Config(e.to_string()))?;
    for entry in &cfg.tools.plugins {
        let name = registry
            .register_external(entry.provider(), Arc::new(PluginTool::new(entry, workspace)))
            .map_err(|e| AgentError::Config(e.to_string()))?;
        tracing::info!(tool = %name, program = %entry.program, "Plugin tool registered");
    }
    Ok(registry)
}

/// 长期运行的 Agent
pub struct AgentRuntime {
    engine: TurnEngine,
    wake: Box<dyn WakePolicy>,
    processes: ProcessSessionManager,
    shutdown: Arc<ShutdownManager>,
}

impl AgentRuntime {
    pub async fn from_config(
        cfg: &AppConfig,
        shutdown: Arc<ShutdownManager>,
    ) -> anyhow::Result<Self> {
        let workspace = cfg.app.workspace();
        std::fs::create_dir_all(&workspace)
            .with_context(|| format!("creating workspace {}", workspace.display()))?;

        let processes = ProcessSessionManager::open(ProcessConfig::from_app(cfg))
            .await
            .context("loading process sessions")?;
        let llm = create_llm_from_config(cfg)?;
        let registry = build_registry(cfg, &processes, &workspace)?;
        tracing::info!(tools = ?registry.tool_names(), "Tool catalogue ready");

        let store = Arc::new(JsonlTranscriptStore::for_agent(
            cfg.app.transcript_dir(),
            &cfg.app.agent_id,
        ));
        let preamble = StaticPreamble::load(cfg.app.system_prompt_path.as_deref())?;

        let mut engine = TurnEngine::new(
            llm,
            ToolExecutor::new(registry, cfg.engine.tool_timeout_secs),
            ContextManager::new(cfg.context_config()),
            store.clone(),
            Box::new(preamble),
        )
        .with_retry(RetryPolicy::new(
            cfg.engine.max_retries,
            Duration::from_secs(cfg.engine.retry_base_secs),
        ));

        match engine.restore(cfg.history_load_limit()).await {
            Ok(n) => tracing::info!(
                messages = n,
                path = %store.path().display(),
                "Transcript restored"
            ),
            Err(e) => tracing::warn!(error = %e, "Transcript restore failed, starting empty"),
        }

        let wake = AdaptiveWake::new(
            Duration::from_secs(cfg.engine.wake_interval_secs),
            Duration::from_secs(cfg.engine.max_idle_interval_secs),
        );

        Ok(Self {
            engine,
            wake: Box::new(wake),
            processes,
            shutdown,
        })
    }

    pub fn with_wake(mut self, wake: Box<dyn WakePolicy>) -> Self {
        self.wake = wake;
        self
    }

    pub fn processes(&self) -> &ProcessSessionManager {
        &self.processes
    }

    pub fn engine(&self) -> &TurnEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut TurnEngine {
        &mut self.engine
    }

    /// 主循环；关闭后放弃进行中的回合（已提交的回合都已落盘）
    pub async fn run(&mut self) -> Result<(), AgentError> {
        let shutdown = Arc::clone(&self.shutdown);
        while !shutdown.is_shutdown() {
            let outcome = tokio::select! {
                res = self.engine.run_turn() => res?,
                _ = shutdown.wait_for_shutdown() => {
                    tracing::info!("Shutdown requested, abandoning in-flight turn");
                    break;
                }
            };
            let sleep = self.wake.next_sleep(&outcome);
            tracing::debug!(sleep_ms = sleep.as_millis() as u64, acted = outcome.acted, "Sleeping until next wake");
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = shutdown.wait_for_shutdown() => break,
            }
        }
        Ok(())
    }
}
