//! 回合引擎（Turn Engine）
//!
//! BUILD_REQUEST -> CALL_BACKEND -> {RETRY | INTERPRET} -> (EXECUTE_TOOLS)? -> COMMIT -> PERSIST。
//! 后端错误按 RetryPolicy 重试，耗尽后以 AgentError::BackendExhausted 返回（致命）；
//! 工具错误由 ToolExecutor 转成 ToolResult，从不打断回合；持久化失败只记日志。
//! SLEEP 由调用方根据 WakePolicy 决定。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::core::AgentError;
use crate::llm::{LlmClient, ModelRequest, ModelResponse, TokenUsage};
use crate::memory::{Message, Transcript, TranscriptStore};
use crate::react::{
    sanitize, CompactionReport, ContextManager, PreambleSource, RetryPolicy, TurnEvent,
};
use crate::tools::ToolExecutor;

/// 工具结果预览最大字符数（事件与日志）
const RESULT_PREVIEW_CHARS: usize = 200;

/// 一个回合的结果，供 WakePolicy 与调用方观察
#[derive(Debug, Clone, Default)]
pub struct TurnOutcome {
    /// assistant 的文本回复
    pub text: Option<String>,
    pub tool_calls: usize,
    /// 本回合是否执行了工具
    pub acted: bool,
    /// 后端尝试次数
    pub attempts: u32,
    pub committed: usize,
    pub trimmed: bool,
    pub compaction: CompactionReport,
    pub usage: TokenUsage,
}

pub struct TurnEngine {
    llm: Arc<dyn LlmClient>,
    executor: ToolExecutor,
    context: ContextManager,
    store: Arc<dyn TranscriptStore>,
    preamble: Box<dyn PreambleSource>,
    retry: RetryPolicy,
    transcript: Transcript,
    pending_inputs: Vec<Message>,
    last_wake: Option<DateTime<Utc>>,
    event_tx: Option<mpsc::UnboundedSender<TurnEvent>>,
}

fn preview(text: &str) -> String {
    if text.chars().count() > RESULT_PREVIEW_CHARS {
        format!("{}...", text.chars().take(RESULT_PREVIEW_CHARS).collect::<String>())
    } else {
        text.to_string()
    }
}

/// 人类可读的间隔，如 "2h 5m"、"42s"
fn humanize(elapsed: chrono::Duration) -> String {
    let secs = elapsed.num_seconds().max(0);
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m}m")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}

impl TurnEngine {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        executor: ToolExecutor,
        context: ContextManager,
        store: Arc<dyn TranscriptStore>,
        preamble: Box<dyn PreambleSource>,
    ) -> Self {
        Self {
            llm,
            executor,
            context,
            store,
            preamble,
            retry: RetryPolicy::default(),
            transcript: Transcript::new(),
            pending_inputs: Vec::new(),
            last_wake: None,
            event_tx: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<TurnEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn executor(&self) -> &ToolExecutor {
        &self.executor
    }

    /// 从存储恢复最近 `limit` 条消息并 sanitize；返回恢复的条数
    pub async fn restore(&mut self, limit: usize) -> anyhow::Result<usize> {
        let raw = self.store.load_recent(limit).await?;
        let loaded = raw.len();
        let messages = sanitize(raw);
        if messages.len() < loaded {
            tracing::info!(
                dropped = loaded - messages.len(),
                "Dropped structurally invalid messages while restoring transcript"
            );
        }
        let restored = messages.len();
        self.transcript.replace(messages);
        Ok(restored)
    }

    /// 外部输入（聊天消息等），在下一回合开始时作为 user 消息提交
    pub fn enqueue_input(&mut self, message: Message) {
        self.pending_inputs.push(message);
    }

    fn emit(&self, event: TurnEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// 提交并记录一条新消息
    fn commit(&mut self, message: Message, new_messages: &mut Vec<Message>) {
        new_messages.push(message.clone());
        self.transcript.push(message);
    }

    /// 时间标记：最后一条不是 user 消息时，提交一条 "[wake]" 消息；再提交排队的外部输入
    fn mark_wake(&mut self, now: DateTime<Utc>, new_messages: &mut Vec<Message>) {
        if self.transcript.needs_user_turn() {
            let since = match self.last_wake {
                Some(prev) => format!("{} since last wake", humanize(now - prev)),
                None => "first wake since start".to_string(),
            };
            let marker = Message::user(format!("[wake] {since} ({})", now.to_rfc3339()));
            self.commit(marker, new_messages);
        }
        for input in std::mem::take(&mut self.pending_inputs) {
            self.commit(input, new_messages);
        }
        self.last_wake = Some(now);
    }

    /// 调用后端，失败时按策略退避重试
    async fn call_backend(
        &self,
        request: &ModelRequest,
    ) -> Result<(ModelResponse, u32), AgentError> {
        let mut attempt = 0u32;
        loop {
            match self.llm.generate(request).await {
                Ok(response) => return Ok((response, attempt + 1)),
                Err(e) if self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay(attempt);
                    tracing::warn!(
                        backend = self.llm.name(),
                        attempt = attempt + 1,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Backend call failed, retrying"
                    );
                    self.emit(TurnEvent::BackendRetry {
                        attempt: attempt + 1,
                        delay_ms: delay.as_millis() as u64,
                        error: e.to_string(),
                    });
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        backend = self.llm.name(),
                        attempts = attempt + 1,
                        error = %e,
                        "Backend call failed, retries exhausted"
                    );
                    return Err(AgentError::BackendExhausted {
                        attempts: attempt + 1,
                        source: e,
                    });
                }
            }
        }
    }

    /// 执行一个完整回合
    pub async fn run_turn(&mut self) -> Result<TurnOutcome, AgentError> {
        self.emit(TurnEvent::TurnStarted {
            messages: self.transcript.len(),
        });
        let now = Utc::now();
        let mut new_messages = Vec::new();
        self.mark_wake(now, &mut new_messages);

        // BUILD_REQUEST
        let system = self.preamble.render(now);
        let (request, compaction) =
            self.context
                .build_request(&system, self.transcript.messages(), self.executor.catalogue());
        if compaction.truncated_messages > 0 || compaction.dropped_messages > 0 {
            tracing::debug!(
                truncated = compaction.truncated_messages,
                dropped = compaction.dropped_messages,
                estimated_chars = compaction.estimated_chars,
                "Request compacted"
            );
            self.emit(TurnEvent::Compacted {
                truncated_messages: compaction.truncated_messages,
                dropped_messages: compaction.dropped_messages,
                over_budget: compaction.over_budget,
            });
        }

        // CALL_BACKEND / RETRY
        let (response, attempts) = self.call_backend(&request).await?;

        // INTERPRET / EXECUTE_TOOLS：严格按请求顺序逐个执行
        let mut results = Vec::with_capacity(response.tool_calls.len());
        for call in &response.tool_calls {
            self.emit(TurnEvent::ToolCall {
                id: call.id.clone(),
                tool: call.name.clone(),
                args: call.args.clone(),
            });
            let result = self.executor.dispatch(call).await;
            self.emit(TurnEvent::ToolResult {
                id: call.id.clone(),
                tool: call.name.clone(),
                is_error: result.is_error,
                preview: preview(result.output.as_text()),
            });
            results.push(result);
        }

        // COMMIT
        let tool_calls = response.tool_calls.len();
        let text = response.text.clone();
        let assistant = Message::assistant_turn(response.text, response.tool_calls, response.metadata);
        self.commit(assistant, &mut new_messages);
        if !results.is_empty() {
            self.commit(Message::tool_results(results), &mut new_messages);
        }
        self.emit(TurnEvent::Committed {
            messages: new_messages.len(),
        });

        let trim = self.context.trim_steady(self.transcript.messages());
        if let Some(trim) = trim.as_ref() {
            tracing::info!(
                dropped = trim.dropped,
                remaining = trim.messages.len(),
                "Transcript trimmed"
            );
            self.transcript.replace(trim.messages.clone());
            self.emit(TurnEvent::Trimmed {
                dropped: trim.dropped,
                remaining: self.transcript.len(),
            });
        }

        // PERSIST：只追加本回合新消息；失败不影响运行
        if let Err(e) = self.store.append_many(&new_messages).await {
            tracing::warn!(error = %e, count = new_messages.len(), "Failed to persist turn");
        }
        if let Some(trim) = trim.as_ref() {
            if let Err(e) = self.store.record_trim(trim.window, &trim.notice).await {
                tracing::warn!(error = %e, "Failed to persist trim checkpoint");
            }
        }

        tracing::info!(
            attempts,
            tool_calls,
            committed = new_messages.len(),
            transcript_len = self.transcript.len(),
            total_tokens = response.usage.total_tokens,
            "Turn complete"
        );

        Ok(TurnOutcome {
            text,
            tool_calls,
            acted: tool_calls > 0,
            attempts,
            committed: new_messages.len(),
            trimmed: trim.is_some(),
            compaction,
            usage: response.usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockLlmClient};
    use crate::memory::{Role, ToolCall, ToolOutput};
    use crate::react::ContextConfig;
    use crate::tools::{Tool, ToolRegistry};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use std::time::Duration;

    /// 只在内存里记录的存储
    #[derive(Default)]
    struct MemoryStore {
        appended: Mutex<Vec<Message>>,
        trims: Mutex<Vec<usize>>,
        fail: bool,
    }

    #[async_trait]
    impl TranscriptStore for MemoryStore {
        async fn load_recent(&self, limit: usize) -> anyhow::Result<Vec<Message>> {
            let all = self.appended.lock().unwrap().clone();
            let start = all.len().saturating_sub(limit);
            Ok(all[start..].to_vec())
        }

        async fn append_many(&self, messages: &[Message]) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("disk full");
            }
            self.appended.lock().unwrap().extend_from_slice(messages);
            Ok(())
        }

        async fn record_trim(&self, window: usize, _notice: &Message) -> anyhow::Result<()> {
            self.trims.lock().unwrap().push(window);
            Ok(())
        }
    }

    struct Upper;

    #[async_trait]
    impl Tool for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        fn description(&self) -> &str {
            "uppercase text"
        }

        async fn execute(&self, args: Value) -> Result<ToolOutput, String> {
            args["text"]
                .as_str()
                .map(|t| ToolOutput::text(t.to_uppercase()))
                .ok_or_else(|| "missing text".to_string())
        }
    }

    fn engine(llm: Arc<MockLlmClient>, store: Arc<MemoryStore>) -> TurnEngine {
        let mut registry = ToolRegistry::new();
        registry.register(Upper).unwrap();
        TurnEngine::new(
            llm,
            ToolExecutor::new(registry, 5),
            ContextManager::new(ContextConfig::default()),
            store,
            Box::new(crate::react::StaticPreamble::new("test")),
        )
        .with_retry(RetryPolicy::new(3, Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn test_text_only_turn_commits_wake_and_reply() {
        let llm = Arc::new(MockLlmClient::scripted([Ok(ModelResponse::text("idle"))]));
        let store = Arc::new(MemoryStore::default());
        let mut engine = engine(llm.clone(), store.clone());

        let outcome = engine.run_turn().await.unwrap();
        assert_eq!(outcome.text.as_deref(), Some("idle"));
        assert!(!outcome.acted);
        assert_eq!(outcome.committed, 2);

        let msgs = engine.transcript().messages();
        assert_eq!(msgs[0].role, Role::User);
        assert!(msgs[0].text.as_deref().unwrap().starts_with("[wake]"));
        assert_eq!(msgs[1].text.as_deref(), Some("idle"));
        assert_eq!(store.appended.lock().unwrap().len(), 2);

        let req = &llm.requests()[0];
        assert!(req.system.starts_with("test"));
        assert_eq!(req.tools[0].name, "upper");
    }

    #[tokio::test]
    async fn test_tool_calls_execute_in_order_and_failures_become_data() {
        let llm = Arc::new(MockLlmClient::scripted([Ok(ModelResponse::tool_calls(vec![
            ToolCall::new("c1", "upper", json!({"text": "abc"})),
            ToolCall::new("c2", "upper", json!({})),
            ToolCall::new("c3", "missing", json!({})),
        ]))]));
        let store = Arc::new(MemoryStore::default());
        let mut engine = engine(llm, store);
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine = engine.with_events(tx);

        let outcome = engine.run_turn().await.unwrap();
        assert!(outcome.acted);
        assert_eq!(outcome.tool_calls, 3);

        let last = engine.transcript().last().unwrap();
        let ids: Vec<_> = last.tool_results.iter().map(|r| r.tool_call_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
        assert_eq!(last.tool_results[0].output.as_text(), "ABC");
        assert!(last.tool_results[1].is_error);
        assert!(last.tool_results[2].is_error);

        let mut tools_seen = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let TurnEvent::ToolCall { id, .. } = ev {
                tools_seen.push(id);
            }
        }
        assert_eq!(tools_seen, vec!["c1", "c2", "c3"]);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let llm = Arc::new(MockLlmClient::scripted([
            Err(LlmError::Network("reset".into())),
            Err(LlmError::Server {
                status: 503,
                body: "busy".into(),
            }),
            Ok(ModelResponse::text("ok")),
        ]));
        let mut engine = engine(llm.clone(), Arc::new(MemoryStore::default()));
        let outcome = engine.run_turn().await.unwrap();
        assert_eq!(outcome.attempts, 3);
        assert_eq!(llm.calls(), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_is_fatal() {
        let llm = Arc::new(MockLlmClient::scripted(
            (0..5).map(|_| Err(LlmError::Network("down".into()))),
        ));
        let store = Arc::new(MemoryStore::default());
        let mut engine = engine(llm.clone(), store.clone());
        let err = engine.run_turn().await.unwrap_err();
        assert!(matches!(err, AgentError::BackendExhausted { attempts: 3, .. }));
        assert_eq!(llm.calls(), 3);
        assert!(store.appended.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backoff_doubles_between_attempts() {
        let llm = Arc::new(MockLlmClient::scripted(
            (0..5).map(|_| Err(LlmError::Network("down".into()))),
        ));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut engine = engine(llm.clone(), Arc::new(MemoryStore::default()))
            .with_retry(RetryPolicy::new(3, Duration::from_millis(20)))
            .with_events(tx);

        let started = std::time::Instant::now();
        assert!(engine.run_turn().await.is_err());
        // 20ms + 40ms，最后一次失败后不再等待
        assert!(started.elapsed() >= Duration::from_millis(60));

        let mut delays = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let TurnEvent::BackendRetry { delay_ms, .. } = event {
                delays.push(delay_ms);
            }
        }
        assert_eq!(delays, vec![20, 40]);
    }

    #[tokio::test]
    async fn test_persist_failure_does_not_fail_turn() {
        let llm = Arc::new(MockLlmClient::scripted([Ok(ModelResponse::text("hi"))]));
        let store = Arc::new(MemoryStore {
            fail: true,
            ..MemoryStore::default()
        });
        let mut engine = engine(llm, store);
        assert!(engine.run_turn().await.is_ok());
        assert_eq!(engine.transcript().len(), 2);
    }

    #[tokio::test]
    async fn test_no_wake_marker_when_last_is_user() {
        let llm = Arc::new(MockLlmClient::new());
        let mut engine = engine(llm, Arc::new(MemoryStore::default()));
        engine.enqueue_input(Message::user("please check the build"));
        engine.run_turn().await.unwrap();
        // 第一回合：wake + 输入 + 回复
        assert_eq!(engine.transcript().len(), 3);
        assert_eq!(
            engine.transcript().messages()[1].text.as_deref(),
            Some("please check the build")
        );

        engine.run_turn().await.unwrap();
        let msgs = engine.transcript().messages();
        assert!(msgs[3].text.as_deref().unwrap().contains("since last wake"));
    }

    #[tokio::test]
    async fn test_steady_trim_keeps_bound() {
        let llm = Arc::new(MockLlmClient::new());
        let store = Arc::new(MemoryStore::default());
        let mut engine = TurnEngine::new(
            llm,
            ToolExecutor::new(ToolRegistry::new(), 5),
            ContextManager::new(ContextConfig {
                max_messages: 5,
                ..ContextConfig::default()
            }),
            store.clone(),
            Box::new(crate::react::StaticPreamble::default()),
        );
        for _ in 0..4 {
            let outcome = engine.run_turn().await.unwrap();
            assert!(engine.transcript().len() <= 5);
            if outcome.trimmed {
                let first = &engine.transcript().messages()[0];
                assert!(first.text.as_deref().unwrap().starts_with("[context trimmed]"));
            }
        }
        assert!(!store.trims.lock().unwrap().is_empty());
    }
}
