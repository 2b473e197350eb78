//! 记忆层：消息模型、内存 Transcript、只追加的持久化日志

pub mod message;
pub mod transcript;
pub mod transcript_store;

pub use message::{ImageData, Message, Role, ToolCall, ToolOutput, ToolResult};
pub use transcript::Transcript;
pub use transcript_store::{JsonlTranscriptStore, TranscriptStore};
