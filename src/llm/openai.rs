//! OpenAI 兼容 Chat Completions 客户端
//!
//! 通过 reqwest 直接调用任意 OpenAI 兼容端点（可配置 base_url）；支持 DeepSeek、OpenAI、自建代理等。
//! 工具调用映射为 `tool_calls` / `role = "tool"`，图片映射为 `image_url` 内容片段；
//! `reasoning_content` 放进 metadata，下次请求原样带回。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::llm::{LlmClient, LlmError, ModelRequest, ModelResponse, TokenUsage, ToolSpec};
use crate::memory::{ImageData, Message, Role, ToolCall};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// 累计 token 用量
#[derive(Debug, Default)]
pub struct UsageCounter {
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    total_tokens: AtomicU64,
}

impl UsageCounter {
    pub fn add(&self, usage: &TokenUsage) {
        self.prompt_tokens.fetch_add(usage.prompt_tokens, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(usage.completion_tokens, Ordering::Relaxed);
        self.total_tokens.fetch_add(usage.total_tokens, Ordering::Relaxed);
    }

    pub fn get(&self) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: self.completion_tokens.load(Ordering::Relaxed),
            total_tokens: self.total_tokens.load(Ordering::Relaxed),
        }
    }
}

/// OpenAI 兼容客户端
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    pub usage: UsageCounter,
}

impl OpenAiClient {
    pub fn new(
        base_url: Option<&str>,
        model: &str,
        api_key: &str,
        timeout_secs: u64,
    ) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| LlmError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url
                .unwrap_or(OPENAI_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
            usage: UsageCounter::default(),
        })
    }

    fn request_body(&self, request: &ModelRequest) -> Value {
        let mut messages = vec![json!({"role": "system", "content": request.system})];
        for msg in &request.messages {
            messages.extend(to_wire_messages(msg));
        }
        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.iter().map(tool_to_wire).collect());
        }
        body
    }
}

fn tool_to_wire(tool: &ToolSpec) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

fn image_part(image: &ImageData) -> Value {
    json!({
        "type": "image_url",
        "image_url": {"url": format!("data:{};base64,{}", image.media_type, image.data)}
    })
}

/// user 文本 + 图片；无图片时用纯字符串 content
fn user_content(text: Option<&str>, images: &[ImageData]) -> Value {
    if images.is_empty() {
        return Value::String(text.unwrap_or_default().to_string());
    }
    let mut parts = Vec::with_capacity(images.len() + 1);
    if let Some(t) = text {
        parts.push(json!({"type": "text", "text": t}));
    }
    parts.extend(images.iter().map(image_part));
    Value::Array(parts)
}

/// 一条 Message 可能展开为多条线上消息（每个工具结果一条 `tool` 消息）
fn to_wire_messages(msg: &Message) -> Vec<Value> {
    match msg.role {
        Role::Assistant => {
            // 没有工具调用的 assistant 消息 content 不能为 null
            let content = match (&msg.text, msg.tool_calls.is_empty()) {
                (None, true) => Value::String(String::new()),
                (text, _) => json!(text),
            };
            let mut m = json!({
                "role": "assistant",
                "content": content,
            });
            if !msg.tool_calls.is_empty() {
                m["tool_calls"] = Value::Array(
                    msg.tool_calls
                        .iter()
                        .map(|c| {
                            json!({
                                "id": c.id,
                                "type": "function",
                                "function": {"name": c.name, "arguments": c.args.to_string()},
                            })
                        })
                        .collect(),
                );
            }
            if let Some(reasoning) = msg
                .metadata
                .as_ref()
                .and_then(|meta| meta.get("reasoning_content"))
            {
                m["reasoning_content"] = reasoning.clone();
            }
            vec![m]
        }
        Role::User => {
            let mut out = Vec::new();
            let mut result_images: Vec<ImageData> = Vec::new();
            for result in &msg.tool_results {
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": result.tool_call_id,
                    "content": result.output.as_text(),
                }));
                result_images.extend(result.output.images().iter().cloned());
            }
            let mut images = msg.images.clone();
            images.extend(result_images);
            if msg.text.is_some() || !images.is_empty() {
                out.push(json!({
                    "role": "user",
                    "content": user_content(msg.text.as_deref(), &images),
                }));
            }
            out
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
    reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

fn parse_response(raw: WireResponse) -> Result<ModelResponse, LlmError> {
    let choice = raw
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::InvalidResponse("no choices in response".to_string()))?;
    let tool_calls = choice
        .message
        .tool_calls
        .into_iter()
        .map(|c| {
            // 参数不是合法 JSON 时原样作为字符串交给工具校验
            let args = serde_json::from_str(&c.function.arguments)
                .unwrap_or(Value::String(c.function.arguments));
            ToolCall::new(c.id, c.function.name, args)
        })
        .collect();
    let usage = raw
        .usage
        .map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        })
        .unwrap_or_default();
    Ok(ModelResponse {
        text: choice.message.content.filter(|t| !t.is_empty()),
        tool_calls,
        usage,
        metadata: choice
            .message
            .reasoning_content
            .map(|r| json!({"reasoning_content": r})),
    })
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after_ms = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000);
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => LlmError::Auth(body),
                429 => LlmError::RateLimited { retry_after_ms },
                code => LlmError::Server { status: code, body },
            });
        }

        let raw: WireResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        let parsed = parse_response(raw)?;
        self.usage.add(&parsed.usage);
        Ok(parsed)
    }

    fn name(&self) -> &str {
        &self.model
    }
}
