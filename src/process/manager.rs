//! 进程会话管理器
//!
//! 每个会话同一时刻至多一个运行中的命令；不同会话完全独立、可并发。
//! 每个命令由一个监管任务独占 Child：等待退出、转发 cancel 信号、超时后先 SIGTERM，
//! 宽限期后 SIGKILL。stdout / stderr 由读取任务增量写入有上限的缓冲。
//! 每次状态变化（创建、启动、结束、删除）后把全部会话原子写入状态文件；写入经 persist_lock 串行化。

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;

use crate::config::AppConfig;
use crate::process::{
    CancelOutcome, CommandState, CommandStatus, OutputBuffer, OutputStream, ProcessError,
    ProcessSession, ProcessSignal, ReadOutput, SessionSnapshot, SessionStateStore, StreamKind,
};

/// 子进程退出后等待读取任务收尾的时间（后台孙进程可能仍持有管道）
const READER_DRAIN: Duration = Duration::from_secs(2);

/// 进程会话配置
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub max_output_chars: usize,
    pub grace: Duration,
    pub default_timeout: Duration,
    pub persisted_output_chars: usize,
    pub state_file: PathBuf,
    pub shell: String,
    /// create 未指定目录时使用，相对目录也以此为基准
    pub default_working_dir: PathBuf,
}

impl ProcessConfig {
    pub fn from_app(cfg: &AppConfig) -> Self {
        Self {
            max_output_chars: cfg.process.max_output_chars,
            grace: Duration::from_secs(cfg.process.grace_secs),
            default_timeout: Duration::from_secs(cfg.process.default_timeout_secs),
            persisted_output_chars: cfg.process.persisted_output_chars,
            state_file: cfg.process_state_file(),
            shell: cfg.process.shell.clone(),
            default_working_dir: cfg.app.workspace(),
        }
    }
}

/// 发给监管任务的控制消息
#[derive(Debug, Clone, Copy)]
struct Control {
    signal: ProcessSignal,
}

/// 运行中命令的控制句柄
struct CommandControl {
    control_tx: mpsc::UnboundedSender<Control>,
    /// 结束后携带最终 CommandState；会话已被删除时为 None
    done_rx: watch::Receiver<Option<CommandState>>,
}

struct SessionEntry {
    session: ProcessSession,
    control: Option<CommandControl>,
}

struct Inner {
    config: ProcessConfig,
    store: SessionStateStore,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    persist_lock: Mutex<()>,
}

impl Inner {
    async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;
        let snapshot = {
            let sessions = self.sessions.lock().await;
            let mut all: Vec<ProcessSession> = sessions
                .values()
                .map(|e| e.session.persisted(self.config.persisted_output_chars))
                .collect();
            all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            all
        };
        if let Err(e) = self.store.save(snapshot).await {
            tracing::warn!(error = %e, path = %self.store.path().display(), "failed to persist process sessions");
        }
    }

    async fn append_output(&self, session_id: &str, stream: OutputStream, chunk: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(cmd) = sessions
            .get_mut(session_id)
            .and_then(|e| e.session.active_command.as_mut())
        {
            cmd.push(stream, chunk);
        }
    }
}

/// 进程会话管理器（可廉价克隆，内部共享）
#[derive(Clone)]
pub struct ProcessSessionManager {
    inner: Arc<Inner>,
}

impl ProcessSessionManager {
    /// 加载状态文件并做崩溃恢复：上次仍在运行的命令一律标记为 cancelled
    pub async fn open(config: ProcessConfig) -> anyhow::Result<Self> {
        let store = SessionStateStore::new(config.state_file.clone());
        let loaded = store.load().await?;
        let now = Utc::now();
        let mut recovered = 0usize;
        let mut sessions = HashMap::with_capacity(loaded.len());
        for mut session in loaded {
            if let Some(cmd) = session.active_command.as_mut() {
                if cmd.status.is_running() {
                    cmd.status = CommandStatus::Cancelled;
                    recovered += 1;
                }
                cmd.finished_at.get_or_insert(now);
            }
            if session.active_command.is_some() {
                session.retire_active();
            }
            for cmd in session.last_command.iter_mut() {
                cmd.stdout.set_cap(config.max_output_chars);
                cmd.stderr.set_cap(config.max_output_chars);
            }
            sessions.insert(
                session.id.clone(),
                SessionEntry {
                    session,
                    control: None,
                },
            );
        }
        tracing::info!(
            sessions = sessions.len(),
            recovered,
            path = %store.path().display(),
            "process sessions loaded"
        );

        let manager = Self {
            inner: Arc::new(Inner {
                config,
                store,
                sessions: Mutex::new(sessions),
                persist_lock: Mutex::new(()),
            }),
        };
        if recovered > 0 {
            tracing::warn!(recovered, "demoted commands left running by a previous process to cancelled");
            manager.inner.persist().await;
        }
        Ok(manager)
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.inner.config
    }

    /// 新建会话；不启动进程
    pub async fn create(
        &self,
        working_directory: Option<PathBuf>,
        environment: BTreeMap<String, String>,
    ) -> SessionSnapshot {
        let base = &self.inner.config.default_working_dir;
        let dir = match working_directory {
            Some(dir) if dir.is_absolute() => dir,
            Some(dir) => base.join(dir),
            None => base.clone(),
        };
        let session = ProcessSession::new(dir, environment);
        let snapshot = session.snapshot();
        tracing::info!(session_id = %session.id, cwd = %session.working_directory.display(), "process session created");
        self.inner.sessions.lock().await.insert(
            session.id.clone(),
            SessionEntry {
                session,
                control: None,
            },
        );
        self.inner.persist().await;
        snapshot
    }

    /// 在会话中运行命令
    ///
    /// background = true 时立即返回 running 状态（含 pid）；否则等待结束并返回最终状态。
    /// `timeout_secs` 为 None 时使用默认超时，为 0 时不设超时。
    pub async fn run(
        &self,
        session_id: &str,
        command: &str,
        timeout_secs: Option<u64>,
        background: bool,
    ) -> Result<CommandState, ProcessError> {
        let timeout = match timeout_secs {
            None => Some(self.inner.config.default_timeout),
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
        };

        let started = {
            let mut sessions = self.inner.sessions.lock().await;
            let entry = sessions
                .get_mut(session_id)
                .ok_or_else(|| ProcessError::UnknownSession(session_id.to_string()))?;
            if entry.session.is_running() {
                return Err(ProcessError::SessionBusy(session_id.to_string()));
            }

            let mut state = CommandState::started(command, self.inner.config.max_output_chars);
            let mut cmd = Command::new(&self.inner.config.shell);
            cmd.arg("-c")
                .arg(command)
                .current_dir(&entry.session.working_directory)
                .envs(&entry.session.environment)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            // 独立进程组，信号能到达整条管道
            #[cfg(unix)]
            cmd.process_group(0);
            let spawned = cmd.spawn();

            match spawned {
                Err(e) => {
                    // 启动失败也是一次完成的命令，记录在 stderr
                    tracing::warn!(session_id, command, error = %e, "process spawn failed");
                    state.status = CommandStatus::Exited;
                    state.finished_at = Some(Utc::now());
                    state.push(OutputStream::Stderr, &format!("failed to spawn command: {e}\n"));
                    entry.session.active_command = Some(state);
                    let done = entry.session.retire_active().cloned();
                    Err(done)
                }
                Ok(mut child) => {
                    state.pid = child.id();
                    tracing::info!(session_id, command, pid = ?state.pid, background, "process command started");
                    let snapshot = state.clone();
                    entry.session.active_command = Some(state);
                    entry.session.updated_at = Utc::now();

                    let mut readers = Vec::with_capacity(2);
                    if let Some(out) = child.stdout.take() {
                        readers.push(spawn_reader(
                            Arc::clone(&self.inner),
                            session_id.to_string(),
                            OutputStream::Stdout,
                            out,
                        ));
                    }
                    if let Some(err) = child.stderr.take() {
                        readers.push(spawn_reader(
                            Arc::clone(&self.inner),
                            session_id.to_string(),
                            OutputStream::Stderr,
                            err,
                        ));
                    }

                    let (control_tx, control_rx) = mpsc::unbounded_channel();
                    let (done_tx, done_rx) = watch::channel(None);
                    entry.control = Some(CommandControl {
                        control_tx,
                        done_rx: done_rx.clone(),
                    });
                    tokio::spawn(supervise(
                        Arc::clone(&self.inner),
                        session_id.to_string(),
                        child,
                        timeout,
                        control_rx,
                        readers,
                        done_tx,
                    ));
                    Ok((snapshot, done_rx))
                }
            }
        };

        self.inner.persist().await;

        let (snapshot, done_rx) = match started {
            Ok(pair) => pair,
            Err(done) => {
                return done.ok_or_else(|| ProcessError::UnknownSession(session_id.to_string()))
            }
        };
        if background {
            return Ok(snapshot);
        }
        wait_done(done_rx)
            .await
            .ok_or_else(|| ProcessError::UnknownSession(session_id.to_string()))
    }

    /// 读取活动命令（没有则最近完成的命令）某个流的最后 `tail_chars` 个字符；不阻塞
    pub async fn read(
        &self,
        session_id: &str,
        stream: StreamKind,
        tail_chars: usize,
    ) -> Result<ReadOutput, ProcessError> {
        let sessions = self.inner.sessions.lock().await;
        let entry = sessions
            .get(session_id)
            .ok_or_else(|| ProcessError::UnknownSession(session_id.to_string()))?;

        let Some(cmd) = entry.session.current_command() else {
            return Ok(ReadOutput {
                session_id: session_id.to_string(),
                stream,
                status: None,
                content: String::new(),
                truncated: false,
                total_chars: 0,
            });
        };

        let (content, truncated, total_chars) = match (stream, cmd.combined.as_ref()) {
            (StreamKind::Stdout, _) => tail_of(&cmd.stdout, tail_chars),
            (StreamKind::Stderr, _) => tail_of(&cmd.stderr, tail_chars),
            (StreamKind::Combined, Some(combined)) => tail_of(combined, tail_chars),
            // 重启后没有交错视图：stdout 在前，stderr 在后
            (StreamKind::Combined, None) => {
                let mut joined = OutputBuffer::default();
                joined.push(cmd.stdout.as_str());
                joined.push(cmd.stderr.as_str());
                let (content, cut) = joined.tail(tail_chars);
                (
                    content,
                    cut || cmd.stdout.has_dropped() || cmd.stderr.has_dropped(),
                    cmd.stdout.total_chars() + cmd.stderr.total_chars(),
                )
            }
        };

        Ok(ReadOutput {
            session_id: session_id.to_string(),
            stream,
            status: Some(cmd.status),
            content,
            truncated,
            total_chars,
        })
    }

    /// 向运行中的命令发送信号；SIGTERM（默认）会把命令标记为 cancelled，并在宽限期后升级为 SIGKILL
    pub async fn cancel(
        &self,
        session_id: &str,
        signal: Option<&str>,
    ) -> Result<CancelOutcome, ProcessError> {
        let signal = match signal {
            Some(s) => s.parse::<ProcessSignal>()?,
            None => ProcessSignal::Term,
        };
        let sessions = self.inner.sessions.lock().await;
        let entry = sessions
            .get(session_id)
            .ok_or_else(|| ProcessError::UnknownSession(session_id.to_string()))?;

        let delivered = entry.session.is_running()
            && entry
                .control
                .as_ref()
                .is_some_and(|c| c.control_tx.send(Control { signal }).is_ok());

        let message = if delivered {
            let pid = entry
                .session
                .active_command
                .as_ref()
                .and_then(|c| c.pid)
                .map_or_else(|| "?".to_string(), |p| p.to_string());
            format!("sent {signal} to pid {pid}")
        } else {
            "no running command; nothing to cancel".to_string()
        };
        tracing::info!(session_id, %signal, delivered, "process cancel");
        Ok(CancelOutcome {
            session_id: session_id.to_string(),
            signal: signal.name().to_string(),
            delivered,
            message,
        })
    }

    pub async fn status(&self, session_id: &str) -> Result<SessionSnapshot, ProcessError> {
        let sessions = self.inner.sessions.lock().await;
        sessions
            .get(session_id)
            .map(|e| e.session.snapshot())
            .ok_or_else(|| ProcessError::UnknownSession(session_id.to_string()))
    }

    /// 全部会话快照，按创建时间排序
    pub async fn list(&self) -> Vec<SessionSnapshot> {
        let sessions = self.inner.sessions.lock().await;
        let mut all: Vec<SessionSnapshot> = sessions.values().map(|e| e.session.snapshot()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    /// 删除会话；有运行中的命令时需要 force，先 cancel 并等待其结束
    pub async fn close(&self, session_id: &str, force: bool) -> Result<(), ProcessError> {
        let pending = {
            let sessions = self.inner.sessions.lock().await;
            let entry = sessions
                .get(session_id)
                .ok_or_else(|| ProcessError::UnknownSession(session_id.to_string()))?;
            match entry.control.as_ref() {
                Some(control) if entry.session.is_running() => {
                    if !force {
                        return Err(ProcessError::SessionRunning(session_id.to_string()));
                    }
                    let _ = control.control_tx.send(Control {
                        signal: ProcessSignal::Term,
                    });
                    Some(control.done_rx.clone())
                }
                _ => None,
            }
        };

        if let Some(done_rx) = pending {
            let wait = self.inner.config.grace + READER_DRAIN;
            if tokio::time::timeout(wait, wait_done(done_rx)).await.is_err() {
                tracing::warn!(session_id, "command did not finish before close; removing session anyway");
            }
        }

        self.inner.sessions.lock().await.remove(session_id);
        self.inner.persist().await;
        tracing::info!(session_id, "process session closed");
        Ok(())
    }

    /// 关闭时调用：向所有运行中的命令发 SIGTERM，等待结束（最多宽限期）后写盘
    pub async fn shutdown_all(&self) {
        let pending = {
            let sessions = self.inner.sessions.lock().await;
            let mut pending = Vec::new();
            for entry in sessions.values().filter(|e| e.session.is_running()) {
                let Some(control) = entry.control.as_ref() else {
                    continue;
                };
                let term = Control {
                    signal: ProcessSignal::Term,
                };
                if control.control_tx.send(term).is_ok() {
                    pending.push(control.done_rx.clone());
                }
            }
            pending
        };
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "terminating running commands");
            let wait = self.inner.config.grace + READER_DRAIN;
            let all = futures_util::future::join_all(pending.into_iter().map(wait_done));
            if tokio::time::timeout(wait, all).await.is_err() {
                tracing::warn!("some commands did not exit before shutdown");
            }
        }
        self.inner.persist().await;
    }
}

fn tail_of(buf: &OutputBuffer, n: usize) -> (String, bool, u64) {
    let (content, truncated) = buf.tail(n);
    (content, truncated, buf.total_chars())
}

/// 等待监管任务公布最终状态；会话被删除时返回 None
async fn wait_done(mut rx: watch::Receiver<Option<CommandState>>) -> Option<CommandState> {
    loop {
        if let Some(done) = rx.borrow_and_update().clone() {
            return Some(done);
        }
        if rx.changed().await.is_err() {
            return rx.borrow().clone();
        }
    }
}

/// 增量解码 UTF-8；不完整的尾部字节留在 carry 中等下一块
fn decode_utf8(carry: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(carry) {
            Ok(s) => {
                out.push_str(s);
                carry.clear();
                return out;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&carry[..valid]));
                match e.error_len() {
                    Some(len) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        carry.drain(..valid + len);
                    }
                    None => {
                        carry.drain(..valid);
                        return out;
                    }
                }
            }
        }
    }
}

fn spawn_reader<R>(
    inner: Arc<Inner>,
    session_id: String,
    stream: OutputStream,
    mut reader: R,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        let mut carry = Vec::new();
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(session_id = %session_id, error = %e, "output reader stopped");
                    break;
                }
            };
            carry.extend_from_slice(&buf[..n]);
            let text = decode_utf8(&mut carry);
            if !text.is_empty() {
                inner.append_output(&session_id, stream, &text).await;
            }
        }
        if !carry.is_empty() {
            let rest = String::from_utf8_lossy(&carry).into_owned();
            inner.append_output(&session_id, stream, &rest).await;
        }
    })
}

/// 向子进程所在进程组发送信号；拿不到 pid 时退回 start_kill
fn deliver(child: &mut Child, signal: ProcessSignal) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let pid = pid as libc::pid_t;
            // SAFETY: kill(2) 只投递信号，不涉及内存
            let rc = unsafe { libc::kill(-pid, signal.as_raw()) };
            if rc != 0 {
                let rc = unsafe { libc::kill(pid, signal.as_raw()) };
                if rc != 0 {
                    tracing::debug!(pid, %signal, "signal delivery failed");
                }
            }
            return;
        }
    }
    if let Err(e) = child.start_kill() {
        tracing::debug!(%signal, error = %e, "start_kill failed");
    }
}

/// 升级阶段
#[derive(Debug, Clone, Copy)]
enum Escalation {
    /// 等待退出；Some 为超时时刻
    Waiting(Option<Instant>),
    /// 已发 SIGTERM，到点发 SIGKILL
    Terminating(Instant),
    Killed,
}

impl Escalation {
    fn next_deadline(self) -> Option<Instant> {
        match self {
            Escalation::Waiting(deadline) => deadline,
            Escalation::Terminating(kill_at) => Some(kill_at),
            Escalation::Killed => None,
        }
    }
}

async fn supervise(
    inner: Arc<Inner>,
    session_id: String,
    mut child: Child,
    timeout: Option<Duration>,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
    readers: Vec<JoinHandle<()>>,
    done_tx: watch::Sender<Option<CommandState>>,
) {
    let grace = inner.config.grace;
    let mut phase = Escalation::Waiting(timeout.map(|t| Instant::now() + t));
    let mut timed_out = false;
    let mut cancelled = false;

    let exit = loop {
        let deadline = phase.next_deadline();
        tokio::select! {
            res = child.wait() => break res,
            Some(Control { signal }) = control_rx.recv() => {
                deliver(&mut child, signal);
                match signal {
                    ProcessSignal::Term => {
                        cancelled = true;
                        if let Escalation::Waiting(_) = phase {
                            phase = Escalation::Terminating(Instant::now() + grace);
                        }
                    }
                    ProcessSignal::Kill => phase = Escalation::Killed,
                    ProcessSignal::Int | ProcessSignal::Hup => {}
                }
            }
            _ = sleep_until_opt(deadline), if deadline.is_some() => {
                match phase {
                    Escalation::Waiting(_) => {
                        tracing::warn!(session_id = %session_id, "command timed out, sending SIGTERM");
                        timed_out = true;
                        deliver(&mut child, ProcessSignal::Term);
                        phase = Escalation::Terminating(Instant::now() + grace);
                    }
                    Escalation::Terminating(_) => {
                        tracing::warn!(session_id = %session_id, "command ignored SIGTERM, sending SIGKILL");
                        deliver(&mut child, ProcessSignal::Kill);
                        phase = Escalation::Killed;
                    }
                    Escalation::Killed => {}
                }
            }
        }
    };

    let aborts: Vec<AbortHandle> = readers.iter().map(|h| h.abort_handle()).collect();
    if tokio::time::timeout(READER_DRAIN, futures_util::future::join_all(readers))
        .await
        .is_err()
    {
        tracing::debug!(session_id = %session_id, "output readers still open after exit, detaching");
        for handle in aborts {
            handle.abort();
        }
    }

    let final_state = {
        let mut sessions = inner.sessions.lock().await;
        match sessions.get_mut(&session_id) {
            Some(entry) => {
                entry.control = None;
                if let Some(cmd) = entry.session.active_command.as_mut() {
                    apply_exit(cmd, exit, timed_out, cancelled);
                }
                entry.session.retire_active().cloned()
            }
            None => None,
        }
    };
    if let Some(cmd) = final_state.as_ref() {
        tracing::info!(
            session_id = %session_id,
            status = ?cmd.status,
            exit_code = ?cmd.exit_code,
            signal = ?cmd.signal,
            "process command finished"
        );
    }
    inner.persist().await;
    done_tx.send_replace(final_state);
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn apply_exit(
    cmd: &mut CommandState,
    exit: std::io::Result<ExitStatus>,
    timed_out: bool,
    cancelled: bool,
) {
    cmd.finished_at = Some(Utc::now());
    cmd.timed_out = timed_out;
    match exit {
        Ok(status) => {
            cmd.exit_code = status.code();
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                cmd.signal = status.signal().map(crate::process::signal_name);
            }
        }
        Err(e) => cmd.push(OutputStream::Stderr, &format!("\nfailed to wait for command: {e}\n")),
    }
    cmd.status = if timed_out {
        CommandStatus::TimedOut
    } else if cancelled {
        CommandStatus::Cancelled
    } else {
        CommandStatus::Exited
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_utf8_keeps_partial_tail() {
        let bytes = "héllo".as_bytes();
        // 在 é 的两个字节之间切开
        let mut carry = bytes[..2].to_vec();
        assert_eq!(decode_utf8(&mut carry), "h");
        assert_eq!(carry.len(), 1);
        carry.extend_from_slice(&bytes[2..]);
        assert_eq!(decode_utf8(&mut carry), "éllo");
        assert!(carry.is_empty());
    }

    #[test]
    fn test_decode_utf8_replaces_invalid_bytes() {
        let mut carry = vec![b'a', 0xff, b'b'];
        assert_eq!(decode_utf8(&mut carry), "a\u{fffd}b");
        assert!(carry.is_empty());
    }

    fn config(dir: &std::path::Path) -> ProcessConfig {
        ProcessConfig {
            max_output_chars: 1000,
            grace: Duration::from_millis(500),
            default_timeout: Duration::from_secs(30),
            persisted_output_chars: 100,
            state_file: dir.join("sessions.json"),
            shell: "sh".to_string(),
            default_working_dir: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = ProcessSessionManager::open(config(dir.path())).await.unwrap();
        assert_eq!(
            mgr.run("nope", "true", None, false).await.unwrap_err(),
            ProcessError::UnknownSession("nope".into())
        );
        assert!(matches!(
            mgr.read("nope", StreamKind::Stdout, 10).await,
            Err(ProcessError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_read_before_any_command() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = ProcessSessionManager::open(config(dir.path())).await.unwrap();
        let session = mgr.create(None, BTreeMap::new()).await;
        let out = mgr.read(&session.id, StreamKind::Combined, 100).await.unwrap();
        assert_eq!(out.status, None);
        assert!(out.content.is_empty());
        assert_eq!(session.working_directory, dir.path());
    }

    #[tokio::test]
    async fn test_cancel_without_running_command_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = ProcessSessionManager::open(config(dir.path())).await.unwrap();
        let session = mgr.create(None, BTreeMap::new()).await;
        let outcome = mgr.cancel(&session.id, None).await.unwrap();
        assert!(!outcome.delivered);
        assert_eq!(outcome.signal, "SIGTERM");
        assert_eq!(
            mgr.cancel(&session.id, Some("SIGUSR2")).await.unwrap_err(),
            ProcessError::InvalidSignal("SIGUSR2".into())
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_foreground_captures_streams_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = ProcessSessionManager::open(config(dir.path())).await.unwrap();
        let mut env = BTreeMap::new();
        env.insert("GREETING".to_string(), "hola".to_string());
        let session = mgr.create(None, env).await;

        let done = mgr
            .run(&session.id, "echo $GREETING; echo oops >&2; exit 3", Some(10), false)
            .await
            .unwrap();
        assert_eq!(done.status, CommandStatus::Exited);
        assert_eq!(done.exit_code, Some(3));
        assert_eq!(done.stdout.as_str(), "hola\n");
        assert_eq!(done.stderr.as_str(), "oops\n");

        let snap = mgr.status(&session.id).await.unwrap();
        assert!(snap.active_command.is_none());
        assert_eq!(snap.last_command.unwrap().exit_code, Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_marks_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = ProcessSessionManager::open(config(dir.path())).await.unwrap();
        let session = mgr.create(None, BTreeMap::new()).await;
        let started = mgr.run(&session.id, "sleep 30", Some(60), true).await.unwrap();
        assert_eq!(started.status, CommandStatus::Running);
        assert!(started.pid.is_some());

        let outcome = mgr.cancel(&session.id, None).await.unwrap();
        assert!(outcome.delivered);

        let mut last = None;
        for _ in 0..50 {
            let snap = mgr.status(&session.id).await.unwrap();
            if snap.active_command.is_none() {
                last = snap.last_command;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let last = last.expect("command should have finished");
        assert_eq!(last.status, CommandStatus::Cancelled);
        assert_eq!(last.signal.as_deref(), Some("SIGTERM"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_close_requires_force_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = ProcessSessionManager::open(config(dir.path())).await.unwrap();
        let session = mgr.create(None, BTreeMap::new()).await;
        mgr.run(&session.id, "sleep 30", Some(60), true).await.unwrap();

        assert_eq!(
            mgr.close(&session.id, false).await.unwrap_err(),
            ProcessError::SessionRunning(session.id.clone())
        );
        mgr.close(&session.id, true).await.unwrap();
        assert!(mgr.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.shell = "/definitely/not/a/shell".to_string();
        let mgr = ProcessSessionManager::open(cfg).await.unwrap();
        let session = mgr.create(None, BTreeMap::new()).await;
        let done = mgr.run(&session.id, "true", None, false).await.unwrap();
        assert_eq!(done.status, CommandStatus::Exited);
        assert!(done.stderr.as_str().contains("failed to spawn"));
        assert!(mgr.status(&session.id).await.unwrap().active_command.is_none());
    }
}
