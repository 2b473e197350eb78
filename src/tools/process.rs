//! process 工具：把进程会话管理器暴露给推理后端
//!
//! 单个工具、以 action 区分操作（create / run / read / cancel / status / list / close），
//! 参数 Schema 由 schemars 从 ProcessArgs 生成，与反序列化的结构保持一致。
//! 前置条件错误（未知会话、会话忙等）以 Err 返回，由 ToolExecutor 转成错误结果。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::memory::ToolOutput;
use crate::process::{CommandState, ProcessSessionManager, StreamKind};
use crate::tools::Tool;

/// read 未指定 tail_chars 时返回的字符数
const DEFAULT_TAIL_CHARS: usize = 4_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
enum ProcessAction {
    Create,
    Run,
    Read,
    Cancel,
    Status,
    List,
    Close,
}

/// process 工具参数
#[derive(Debug, Deserialize, JsonSchema)]
struct ProcessArgs {
    /// Operation to perform.
    action: ProcessAction,
    /// Session id returned by `create` (required for every action except create and list).
    #[serde(default)]
    session_id: Option<String>,
    /// create: working directory, relative paths resolve against the workspace.
    #[serde(default)]
    working_directory: Option<PathBuf>,
    /// create: extra environment variables for every command in the session.
    #[serde(default)]
    environment: BTreeMap<String, String>,
    /// run: shell command line.
    #[serde(default)]
    command: Option<String>,
    /// run: seconds before SIGTERM (then SIGKILL after a grace period); 0 disables the timeout.
    /// Foreground runs are capped by the tool call limit; use background for long commands.
    #[serde(default)]
    timeout_seconds: Option<u64>,
    /// run: return immediately and keep the command running; poll with read/status.
    #[serde(default)]
    background: bool,
    /// read: stdout, stderr or combined (default).
    #[serde(default)]
    stream: StreamKind,
    /// read: number of most recent characters to return.
    #[serde(default)]
    tail_chars: Option<usize>,
    /// cancel: SIGTERM (default), SIGINT, SIGHUP or SIGKILL.
    #[serde(default)]
    signal: Option<String>,
    /// close: cancel a running command before deleting the session.
    #[serde(default)]
    force: bool,
}

impl ProcessArgs {
    fn session_id(&self) -> Result<&str, String> {
        self.session_id
            .as_deref()
            .ok_or_else(|| format!("'session_id' is required for action {:?}", self.action))
    }
}

pub struct ProcessTool {
    manager: ProcessSessionManager,
    /// 前台 run 的超时上限；须小于 ToolExecutor 的单次调用超时
    foreground_limit: Option<Duration>,
}

impl ProcessTool {
    pub fn new(manager: ProcessSessionManager) -> Self {
        Self {
            manager,
            foreground_limit: None,
        }
    }

    pub fn with_foreground_limit(mut self, limit: Duration) -> Self {
        self.foreground_limit = Some(limit.max(Duration::from_secs(1)));
        self
    }

    /// 前台命令的实际超时（秒）：不超过上限，0 / 缺省也会被限住
    fn effective_timeout(&self, requested: Option<u64>, background: bool) -> Option<u64> {
        let limit = match self.foreground_limit {
            Some(limit) if !background => limit.as_secs(),
            _ => return requested,
        };
        let wanted = requested.unwrap_or_else(|| self.manager.config().default_timeout.as_secs());
        let capped = if wanted == 0 { limit } else { wanted.min(limit) };
        if capped != wanted {
            tracing::debug!(requested = wanted, capped, "Foreground timeout capped");
        }
        Some(capped)
    }
}

fn pretty(value: &impl serde::Serialize) -> Result<ToolOutput, String> {
    serde_json::to_string_pretty(value)
        .map(ToolOutput::from)
        .map_err(|e| e.to_string())
}

fn run_report(session_id: &str, cmd: &CommandState) -> Value {
    json!({
        "session_id": session_id,
        "command": cmd.command,
        "status": cmd.status,
        "pid": cmd.pid,
        "exit_code": cmd.exit_code,
        "signal": cmd.signal,
        "timed_out": cmd.timed_out,
        "started_at": cmd.started_at,
        "finished_at": cmd.finished_at,
        "stdout": cmd.stdout.as_str(),
        "stderr": cmd.stderr.as_str(),
        "output_truncated": cmd.stdout.has_dropped() || cmd.stderr.has_dropped(),
    })
}

/// 参数 JSON Schema（内联子 schema，顶层为 object）
pub fn process_args_schema() -> Value {
    let settings = schemars::gen::SchemaSettings::draft07().with(|s| {
        s.inline_subschemas = true;
        s.meta_schema = None;
    });
    let root = settings
        .into_generator()
        .into_root_schema_for::<ProcessArgs>();
    let mut value = serde_json::to_value(root).unwrap_or_else(|_| json!({"type": "object"}));
    if let Some(obj) = value.as_object_mut() {
        obj.remove("title");
        obj.remove("definitions");
    }
    value
}

#[async_trait]
impl Tool for ProcessTool {
    fn name(&self) -> &str {
        "process"
    }

    fn description(&self) -> &str {
        "Manage shell sessions. `create` a session, `run` commands in it (foreground waits for the \
         result, capped by the tool call limit; background returns immediately and suits long \
         commands), `read` recent output, `cancel` a running command, \
         inspect with `status`/`list`, and `close` the session. One running command per session; \
         use several sessions for parallel work."
    }

    fn parameters_schema(&self) -> Value {
        process_args_schema()
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, String> {
        let args: ProcessArgs =
            serde_json::from_value(args).map_err(|e| format!("invalid arguments: {e}"))?;
        match args.action {
            ProcessAction::Create => {
                let session = self
                    .manager
                    .create(args.working_directory.clone(), args.environment.clone())
                    .await;
                pretty(&session)
            }
            ProcessAction::Run => {
                let session_id = args.session_id()?;
                let command = args
                    .command
                    .as_deref()
                    .filter(|c| !c.trim().is_empty())
                    .ok_or("'command' is required for action Run")?;
                let timeout = self.effective_timeout(args.timeout_seconds, args.background);
                let cmd = self
                    .manager
                    .run(session_id, command, timeout, args.background)
                    .await
                    .map_err(|e| e.to_string())?;
                pretty(&run_report(session_id, &cmd))
            }
            ProcessAction::Read => {
                let out = self
                    .manager
                    .read(
                        args.session_id()?,
                        args.stream,
                        args.tail_chars.unwrap_or(DEFAULT_TAIL_CHARS),
                    )
                    .await
                    .map_err(|e| e.to_string())?;
                pretty(&out)
            }
            ProcessAction::Cancel => {
                let outcome = self
                    .manager
                    .cancel(args.session_id()?, args.signal.as_deref())
                    .await
                    .map_err(|e| e.to_string())?;
                pretty(&outcome)
            }
            ProcessAction::Status => {
                let snapshot = self
                    .manager
                    .status(args.session_id()?)
                    .await
                    .map_err(|e| e.to_string())?;
                pretty(&snapshot)
            }
            ProcessAction::List => pretty(&self.manager.list().await),
            ProcessAction::Close => {
                let session_id = args.session_id()?;
                self.manager
                    .close(session_id, args.force)
                    .await
                    .map_err(|e| e.to_string())?;
                pretty(&json!({"session_id": session_id, "closed": true}))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessConfig;
    use std::time::Duration;

    async fn tool(dir: &std::path::Path) -> ProcessTool {
        let manager = ProcessSessionManager::open(ProcessConfig {
            max_output_chars: 1000,
            grace: Duration::from_millis(500),
            default_timeout: Duration::from_secs(30),
            persisted_output_chars: 100,
            state_file: dir.join("sessions.json"),
            shell: "sh".to_string(),
            default_working_dir: dir.to_path_buf(),
        })
        .await
        .unwrap();
        ProcessTool::new(manager)
    }

    #[test]
    fn test_schema_is_flat_object() {
        let schema = process_args_schema();
        assert_eq!(schema["type"], "object");
        assert!(schema["properties"]["action"].to_string().contains("\"run\""));
        assert!(schema.get("$schema").is_none());
        assert_eq!(schema["required"], json!(["action"]));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_create_run_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let tool = tool(dir.path()).await;

        let created: Value =
            serde_json::from_str(tool.execute(json!({"action": "create"})).await.unwrap().as_text())
                .unwrap();
        let id = created["id"].as_str().unwrap().to_string();

        let ran: Value = serde_json::from_str(
            tool.execute(json!({"action": "run", "session_id": id, "command": "printf abc"}))
                .await
                .unwrap()
                .as_text(),
        )
        .unwrap();
        assert_eq!(ran["status"], "exited");
        assert_eq!(ran["stdout"], "abc");

        let read: Value = serde_json::from_str(
            tool.execute(json!({"action": "read", "session_id": id, "stream": "stdout", "tail_chars": 2}))
                .await
                .unwrap()
                .as_text(),
        )
        .unwrap();
        assert_eq!(read["content"], "bc");
        assert_eq!(read["truncated"], true);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_foreground_run_is_capped_by_call_limit() {
        let dir = tempfile::tempdir().unwrap();
        let tool = tool(dir.path())
            .await
            .with_foreground_limit(Duration::from_secs(1));
        let created: Value =
            serde_json::from_str(tool.execute(json!({"action": "create"})).await.unwrap().as_text())
                .unwrap();
        let id = created["id"].as_str().unwrap().to_string();

        // timeout_seconds = 0 在前台也不会无限等待
        let started = std::time::Instant::now();
        let ran: Value = serde_json::from_str(
            tool.execute(json!({"action": "run", "session_id": id, "command": "sleep 5", "timeout_seconds": 0}))
                .await
                .unwrap()
                .as_text(),
        )
        .unwrap();
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(ran["status"], "timed_out");
        assert_eq!(ran["timed_out"], true);

        assert_eq!(tool.effective_timeout(Some(600), false), Some(1));
        assert_eq!(tool.effective_timeout(None, false), Some(1));
        // 后台命令不受限制
        assert_eq!(tool.effective_timeout(Some(0), true), Some(0));
        assert_eq!(tool.effective_timeout(None, true), None);
    }

    #[tokio::test]
    async fn test_missing_session_id_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let tool = tool(dir.path()).await;
        let err = tool.execute(json!({"action": "status"})).await.unwrap_err();
        assert!(err.contains("session_id"));
        let err = tool.execute(json!({"action": "explode"})).await.unwrap_err();
        assert!(err.contains("invalid arguments"));
    }
}
