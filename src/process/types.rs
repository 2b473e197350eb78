//! 进程会话数据模型：ProcessSession / CommandState 以及 read / status 的返回形态

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::process::{OutputBuffer, ProcessError};

/// 命令状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Running,
    Exited,
    TimedOut,
    Cancelled,
}

impl CommandStatus {
    pub fn is_running(self) -> bool {
        self == CommandStatus::Running
    }
}

/// 一次命令的生命周期记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandState {
    pub command: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pid: Option<u32>,
    pub status: CommandStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// 终止进程的信号名（如 SIGKILL）
    #[serde(default)]
    pub signal: Option<String>,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub stdout: OutputBuffer,
    #[serde(default)]
    pub stderr: OutputBuffer,
    /// stdout / stderr 按到达顺序交错的视图，只在内存中维护
    #[serde(skip)]
    pub combined: Option<OutputBuffer>,
}

impl CommandState {
    pub fn started(command: &str, cap: usize) -> Self {
        Self {
            command: command.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            pid: None,
            status: CommandStatus::Running,
            exit_code: None,
            signal: None,
            timed_out: false,
            stdout: OutputBuffer::new(cap),
            stderr: OutputBuffer::new(cap),
            combined: Some(OutputBuffer::new(cap)),
        }
    }

    pub fn push(&mut self, stream: OutputStream, chunk: &str) {
        match stream {
            OutputStream::Stdout => self.stdout.push(chunk),
            OutputStream::Stderr => self.stderr.push(chunk),
        }
        if let Some(combined) = self.combined.as_mut() {
            combined.push(chunk);
        }
    }

    pub fn summary(&self) -> CommandSummary {
        CommandSummary {
            command: self.command.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            pid: self.pid,
            status: self.status,
            exit_code: self.exit_code,
            signal: self.signal.clone(),
            timed_out: self.timed_out,
            stdout_chars: self.stdout.total_chars(),
            stderr_chars: self.stderr.total_chars(),
        }
    }

    /// 写入状态文件的副本：缓冲裁到 `max_chars`
    pub fn persisted(&self, max_chars: usize) -> Self {
        Self {
            stdout: self.stdout.trimmed(max_chars),
            stderr: self.stderr.trimmed(max_chars),
            combined: None,
            ..self.clone()
        }
    }
}

/// 子进程的输出流
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// read 可选择的流
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
    #[default]
    Combined,
}

/// 进程会话：跨多次命令的执行上下文
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSession {
    pub id: String,
    pub working_directory: PathBuf,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub active_command: Option<CommandState>,
    #[serde(default)]
    pub last_command: Option<CommandState>,
}

impl ProcessSession {
    pub fn new(working_directory: PathBuf, environment: BTreeMap<String, String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            working_directory,
            environment,
            created_at: now,
            updated_at: now,
            active_command: None,
            last_command: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.active_command
            .as_ref()
            .is_some_and(|c| c.status.is_running())
    }

    /// 活动命令优先，否则最近完成的命令
    pub fn current_command(&self) -> Option<&CommandState> {
        self.active_command.as_ref().or(self.last_command.as_ref())
    }

    /// 把活动命令标记为结束并移到 last_command
    pub fn retire_active(&mut self) -> Option<&CommandState> {
        let done = self.active_command.take()?;
        self.last_command = Some(done);
        self.updated_at = Utc::now();
        self.last_command.as_ref()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            working_directory: self.working_directory.clone(),
            environment: self.environment.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            active_command: self.active_command.as_ref().map(CommandState::summary),
            last_command: self.last_command.as_ref().map(CommandState::summary),
        }
    }

    pub fn persisted(&self, max_chars: usize) -> Self {
        Self {
            active_command: self.active_command.as_ref().map(|c| c.persisted(max_chars)),
            last_command: self.last_command.as_ref().map(|c| c.persisted(max_chars)),
            ..self.clone()
        }
    }
}

/// 不含缓冲内容的命令摘要
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandSummary {
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
    pub status: CommandStatus,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub timed_out: bool,
    pub stdout_chars: u64,
    pub stderr_chars: u64,
}

/// status / list 的返回
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub working_directory: PathBuf,
    pub environment: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub active_command: Option<CommandSummary>,
    pub last_command: Option<CommandSummary>,
}

/// read 的返回
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadOutput {
    pub session_id: String,
    pub stream: StreamKind,
    /// 读取的命令状态；会话从未运行过命令时为 None
    pub status: Option<CommandStatus>,
    pub content: String,
    /// 是否有更早的输出没有返回（被 tail 截掉或已被缓冲丢弃）
    pub truncated: bool,
    pub total_chars: u64,
}

/// cancel 的返回；没有运行中的命令时 delivered = false
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancelOutcome {
    pub session_id: String,
    pub signal: String,
    pub delivered: bool,
    pub message: String,
}

/// cancel 支持的信号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    Term,
    Int,
    Hup,
    Kill,
}

impl ProcessSignal {
    pub fn name(self) -> &'static str {
        match self {
            ProcessSignal::Term => "SIGTERM",
            ProcessSignal::Int => "SIGINT",
            ProcessSignal::Hup => "SIGHUP",
            ProcessSignal::Kill => "SIGKILL",
        }
    }

    #[cfg(unix)]
    pub fn as_raw(self) -> libc::c_int {
        match self {
            ProcessSignal::Term => libc::SIGTERM,
            ProcessSignal::Int => libc::SIGINT,
            ProcessSignal::Hup => libc::SIGHUP,
            ProcessSignal::Kill => libc::SIGKILL,
        }
    }
}

impl fmt::Display for ProcessSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProcessSignal {
    type Err = ProcessError;

    /// 接受 SIGTERM / TERM / term 等写法
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
        match bare {
            "TERM" => Ok(ProcessSignal::Term),
            "INT" => Ok(ProcessSignal::Int),
            "HUP" => Ok(ProcessSignal::Hup),
            "KILL" => Ok(ProcessSignal::Kill),
            _ => Err(ProcessError::InvalidSignal(s.to_string())),
        }
    }
}

/// 退出信号编号转名称
pub fn signal_name(raw: i32) -> String {
    #[cfg(unix)]
    {
        let known = match raw {
            libc::SIGTERM => Some("SIGTERM"),
            libc::SIGINT => Some("SIGINT"),
            libc::SIGHUP => Some("SIGHUP"),
            libc::SIGKILL => Some("SIGKILL"),
            libc::SIGQUIT => Some("SIGQUIT"),
            libc::SIGPIPE => Some("SIGPIPE"),
            libc::SIGSEGV => Some("SIGSEGV"),
            libc::SIGABRT => Some("SIGABRT"),
            _ => None,
        };
        if let Some(name) = known {
            return name.to_string();
        }
    }
    format!("SIG{raw}")
}
