//! 推理后端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient::generate：system + messages + 工具目录 -> 文本 / 工具调用 / 用量。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::memory::{Message, ToolCall};

/// 工具目录中的一项（名称、描述、参数 JSON Schema）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 一次请求
#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
}

/// Token 使用统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// 一次回复
#[derive(Debug, Clone, Default)]
pub struct ModelResponse {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
    /// 后端私有数据，原样保存进 assistant 消息
    pub metadata: Option<Value>,
}

impl ModelResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Default::default()
        }
    }
}

/// 后端错误；Turn Engine 对所有变体一律重试，超出上限后致命
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Backend error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// 推理后端
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse, LlmError>;

    /// 后端名称（日志用）
    fn name(&self) -> &str {
        "llm"
    }
}
