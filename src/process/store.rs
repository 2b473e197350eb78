//! 进程会话状态文件
//!
//! 单个 JSON 文档 `{version, sessions}`，每次状态变化后整体重写：先写临时文件再 rename，
//! 保证任何时刻磁盘上都是完整文档。写入顺序由调用方串行化。

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::process::ProcessSession;

const STATE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    #[serde(default)]
    pub sessions: Vec<ProcessSession>,
}

impl PersistedState {
    pub fn new(sessions: Vec<ProcessSession>) -> Self {
        Self {
            version: STATE_VERSION,
            sessions,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionStateStore {
    path: PathBuf,
}

impl SessionStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取全部会话；文件不存在时为空
    pub async fn load(&self) -> anyhow::Result<Vec<ProcessSession>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("read {}", self.path.display()));
            }
        };
        let state: PersistedState = serde_json::from_str(&raw)
            .with_context(|| format!("parse {}", self.path.display()))?;
        if state.version != STATE_VERSION {
            tracing::warn!(
                version = state.version,
                path = %self.path.display(),
                "unexpected process state version, loading anyway"
            );
        }
        Ok(state.sessions)
    }

    /// 原子重写整个状态文档
    pub async fn save(&self, sessions: Vec<ProcessSession>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("create {}", parent.display()))?;
            }
        }
        let body = serde_json::to_vec_pretty(&PersistedState::new(sessions))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("rename {} -> {}", tmp.display(), self.path.display()))?;
        Ok(())
    }
}
