//! system 提示：每回合重新生成（附带当前时间）

use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an autonomous agent running continuously. \
Each turn you see the conversation so far and decide what to do next. \
Use the `process` tool to run shell commands: create a session, run commands in it, \
and read their output. Long-running work should run in the background while you continue. \
Tool failures are reported back to you as results; decide yourself whether to retry. \
When there is nothing useful to do, reply briefly and wait for the next wake.";

pub trait PreambleSource: Send + Sync {
    fn render(&self, now: DateTime<Utc>) -> String;
}

/// 固定文本 + 当前时间
#[derive(Debug, Clone)]
pub struct StaticPreamble {
    base: String,
}

impl StaticPreamble {
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    /// 从文件读取；路径为 None 时使用内置提示
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let text = std::fs::read_to_string(p)
                    .with_context(|| format!("reading system prompt {}", p.display()))?;
                Ok(Self::new(text.trim_end()))
            }
            None => Ok(Self::default()),
        }
    }
}

impl Default for StaticPreamble {
    fn default() -> Self {
        Self::new(DEFAULT_SYSTEM_PROMPT)
    }
}

impl PreambleSource for StaticPreamble {
    fn render(&self, now: DateTime<Utc>) -> String {
        format!("{}\n\nCurrent time: {}", self.base, now.to_rfc3339())
    }
}
