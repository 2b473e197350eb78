//! 进程会话错误：只有调用前置条件不满足时才报错，进程本身的失败记录在 CommandState 中

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Session {0} already has a running command")]
    SessionBusy(String),

    #[error("Session {0} has a running command; close with force to cancel it")]
    SessionRunning(String),

    #[error("Unsupported signal: {0} (expected SIGTERM, SIGINT, SIGHUP or SIGKILL)")]
    InvalidSignal(String),
}
