//! 运行时错误类型
//!
//! 只有无法在对话内消化的错误才会以 AgentError 向上传播：后端重试耗尽、配置错误、I/O。
//! 工具失败、进程失败、持久化失败都在各自层面转成数据或日志。

use thiserror::Error;

use crate::llm::LlmError;

#[derive(Error, Debug)]
pub enum AgentError {
    /// 推理后端在重试上限内始终失败；交给进程监管者重启
    #[error("Reasoning backend failed after {attempts} attempts: {source}")]
    BackendExhausted {
        attempts: u32,
        #[source]
        source: LlmError,
    },

    #[error("Config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
