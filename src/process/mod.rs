//! 进程会话：以会话 id 为句柄管理可并发、可超时、可崩溃恢复的 shell 命令

pub mod buffer;
pub mod error;
pub mod manager;
pub mod store;
pub mod types;

pub use buffer::OutputBuffer;
pub use error::ProcessError;
pub use manager::{ProcessConfig, ProcessSessionManager};
pub use store::{PersistedState, SessionStateStore};
pub use types::{
    signal_name, CancelOutcome, CommandState, CommandStatus, CommandSummary, OutputStream,
    ProcessSession, ProcessSignal, ReadOutput, SessionSnapshot, StreamKind,
};
