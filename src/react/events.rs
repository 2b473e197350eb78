//! 回合过程事件：供日志之外的观察者（测试、前端）订阅

use serde::Serialize;

/// 单个回合内的过程事件（可序列化为 JSON）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// 回合开始（当前 Transcript 长度）
    TurnStarted { messages: usize },
    /// 后端调用失败，即将重试
    BackendRetry {
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    /// 调用工具
    ToolCall {
        id: String,
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（预览，避免过长）
    ToolResult {
        id: String,
        tool: String,
        is_error: bool,
        preview: String,
    },
    /// 本回合提交的消息数
    Committed { messages: usize },
    /// 稳态裁剪
    Trimmed { dropped: usize, remaining: usize },
    /// 请求前压缩
    Compacted {
        truncated_messages: usize,
        dropped_messages: usize,
        over_budget: bool,
    },
}
