//! 对话消息模型
//!
//! Message 是 Transcript 的最小单元：user / assistant 两种角色，assistant 可携带 tool_calls，
//! user 可携带 tool_results（必须逐一对应上一条 assistant 的 tool_calls）。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 消息角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// 内联图片（base64 编码）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageData {
    pub media_type: String,
    pub data: String,
}

/// 推理后端请求的一次工具调用
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
        }
    }
}

/// 工具输出：纯文本或带图片的富结果
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolOutput {
    Text { text: String },
    Rich { text: String, images: Vec<ImageData> },
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        ToolOutput::Text { text: text.into() }
    }

    pub fn as_text(&self) -> &str {
        match self {
            ToolOutput::Text { text } | ToolOutput::Rich { text, .. } => text,
        }
    }

    pub fn images(&self) -> &[ImageData] {
        match self {
            ToolOutput::Text { .. } => &[],
            ToolOutput::Rich { images, .. } => images,
        }
    }

    /// 替换文本部分，保留图片
    pub fn with_text(&self, text: String) -> Self {
        match self {
            ToolOutput::Text { .. } => ToolOutput::Text { text },
            ToolOutput::Rich { images, .. } => ToolOutput::Rich {
                text,
                images: images.clone(),
            },
        }
    }
}

impl From<String> for ToolOutput {
    fn from(text: String) -> Self {
        ToolOutput::Text { text }
    }
}

impl From<&str> for ToolOutput {
    fn from(text: &str) -> Self {
        ToolOutput::Text {
            text: text.to_string(),
        }
    }
}

/// 一次工具调用的结果；失败也以文本形式记录
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub output: ToolOutput,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(tool_call_id: impl Into<String>, output: ToolOutput) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            output,
            is_error: false,
        }
    }

    pub fn error(tool_call_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            output: ToolOutput::text(text),
            is_error: true,
        }
    }
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageData>,
    /// 后端私有的推理痕迹等，原样保存、原样回放，核心不解释
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Message {
    fn empty(role: Role) -> Self {
        Self {
            role,
            text: None,
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            images: Vec::new(),
            metadata: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::empty(Role::User)
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::empty(Role::Assistant)
        }
    }

    /// assistant 回复：文本、工具调用与元数据均可为空
    pub fn assistant_turn(
        text: Option<String>,
        tool_calls: Vec<ToolCall>,
        metadata: Option<Value>,
    ) -> Self {
        Self {
            text,
            tool_calls,
            metadata,
            ..Self::empty(Role::Assistant)
        }
    }

    /// user 侧的工具结果消息
    pub fn tool_results(results: Vec<ToolResult>) -> Self {
        Self {
            tool_results: results,
            ..Self::empty(Role::User)
        }
    }

    pub fn with_images(mut self, images: Vec<ImageData>) -> Self {
        self.images = images;
        self
    }

    pub fn has_text(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.trim().is_empty())
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn has_tool_results(&self) -> bool {
        !self.tool_results.is_empty()
    }

    /// 本消息的 tool_results 是否恰好回答 `prev` 的 tool_calls（数量、id、顺序一致）
    pub fn answers(&self, prev: &Message) -> bool {
        prev.role == Role::Assistant
            && self.role == Role::User
            && prev.tool_calls.len() == self.tool_results.len()
            && prev
                .tool_calls
                .iter()
                .zip(&self.tool_results)
                .all(|(call, result)| call.id == result.tool_call_id)
    }

    /// 估算字符数：文本 + 工具参数 JSON + 工具结果文本
    pub fn char_len(&self) -> usize {
        let text = self.text.as_deref().map_or(0, |t| t.chars().count());
        let args: usize = self
            .tool_calls
            .iter()
            .map(|c| c.name.chars().count() + c.args.to_string().chars().count())
            .sum();
        let results: usize = self
            .tool_results
            .iter()
            .map(|r| r.output.as_text().chars().count())
            .sum();
        text + args + results
    }
}
