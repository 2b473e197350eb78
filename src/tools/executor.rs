//! 工具调度器
//!
//! 持有 ToolRegistry 与单次调用超时；dispatch 把未知工具、工具返回的 Err、panic、超时统一转成
//! ToolResult 文本，永远不让工具错误中止当前回合。每次调用输出一条结构化审计日志（JSON）。

use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tokio::time::timeout;

use crate::llm::ToolSpec;
use crate::memory::{ToolCall, ToolResult};
use crate::tools::ToolRegistry;

/// 审计日志中参数预览的最大字符数
const ARGS_PREVIEW_CHARS: usize = 200;

pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// 执行一次工具调用，结果（含失败）总是 ToolResult
    pub async fn dispatch(&self, call: &ToolCall) -> ToolResult {
        let start = Instant::now();
        let (result, outcome) = match self.registry.get(&call.name) {
            None => (
                ToolResult::error(
                    &call.id,
                    format!(
                        "Error: unknown tool '{}'. Available tools: {}",
                        call.name,
                        self.registry.tool_names().join(", ")
                    ),
                ),
                "unknown",
            ),
            Some(entry) => {
                let fut = AssertUnwindSafe(entry.tool.execute(call.args.clone())).catch_unwind();
                match timeout(self.timeout, fut).await {
                    Ok(Ok(Ok(output))) => (ToolResult::ok(&call.id, output), "ok"),
                    Ok(Ok(Err(e))) => (ToolResult::error(&call.id, format!("Error: {e}")), "error"),
                    Ok(Err(_)) => (
                        ToolResult::error(&call.id, format!("Error: tool '{}' panicked", call.name)),
                        "panic",
                    ),
                    Err(_) => (
                        ToolResult::error(
                            &call.id,
                            format!(
                                "Error: tool '{}' timed out after {}s",
                                call.name,
                                self.timeout.as_secs()
                            ),
                        ),
                        "timeout",
                    ),
                }
            }
        };

        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": call.name,
            "call_id": call.id,
            "ok": outcome == "ok",
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&call.args),
        });
        tracing::info!(audit = %audit, "tool");
        result
    }

    pub fn catalogue(&self) -> Vec<ToolSpec> {
        self.registry.catalogue()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > ARGS_PREVIEW_CHARS {
        format!("{}...", s.chars().take(ARGS_PREVIEW_CHARS).collect::<String>())
    } else {
        s
    }
}
