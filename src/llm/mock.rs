//! Mock 推理后端（用于测试与无 API Key 的离线运行）
//!
//! 按顺序弹出预置的回复或错误；队列为空时回复一条固定文本。记录每次收到的请求，便于断言。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, ModelRequest, ModelResponse};

/// 脚本化客户端
#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<ModelResponse, LlmError>>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以给定脚本创建
    pub fn scripted(steps: impl IntoIterator<Item = Result<ModelResponse, LlmError>>) -> Self {
        Self {
            script: Mutex::new(steps.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, step: Result<ModelResponse, LlmError>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(step);
        }
    }

    /// 已收到的请求数
    pub fn calls(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// 已收到的请求副本
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse, LlmError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        next.unwrap_or_else(|| Ok(ModelResponse::text("Nothing to do.")))
    }

    fn name(&self) -> &str {
        "mock"
    }
}
