//! 对话持久化：只追加的 JSONL 日志
//!
//! 每行一条记录（带写入时间戳）：普通消息 `kind = "message"`，或稳态裁剪检查点 `kind = "trim"`。
//! 从不改写已落盘的历史；崩溃时最多丢失最后一条未刷盘的记录。

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::memory::Message;
use crate::react::sanitize;

/// 对话存储接口（按 agent 身份区分）
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    /// 最近 `limit` 条消息（未经 sanitize 的原始窗口）
    async fn load_recent(&self, limit: usize) -> anyhow::Result<Vec<Message>>;

    /// 追加新产生的消息
    async fn append_many(&self, messages: &[Message]) -> anyhow::Result<()>;

    /// 追加稳态裁剪检查点：此刻的对话 = notice + sanitize(此前最后 window 条)
    async fn record_trim(&self, window: usize, notice: &Message) -> anyhow::Result<()>;
}

/// 单行记录
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Record {
    Message {
        ts: DateTime<Utc>,
        message: Message,
    },
    Trim {
        ts: DateTime<Utc>,
        window: usize,
        notice: Message,
    },
}

/// 文件实现：`<dir>/<agent_id>.jsonl`
#[derive(Debug)]
pub struct JsonlTranscriptStore {
    path: PathBuf,
    /// 串行化写入，避免并发追加交错
    write_lock: Mutex<()>,
}

impl JsonlTranscriptStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    /// 按目录与 agent 身份定位日志文件
    pub fn for_agent(dir: impl AsRef<Path>, agent_id: &str) -> Self {
        Self::new(dir.as_ref().join(format!("{agent_id}.jsonl")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append_records(&self, records: &[Record]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening {} for append", self.path.display()))?;
        // 上次崩溃留下的半行：先补换行，新记录另起一行
        if ends_mid_line(&mut file)? {
            file.write_all(b"\n")?;
        }
        for record in records {
            let line = serde_json::to_string(record)?;
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
        }
        file.flush()?;
        Ok(())
    }

    /// 重放整个日志，得到当前物化窗口
    fn materialize(&self) -> anyhow::Result<Vec<Message>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        let reader = BufReader::new(file);
        let mut view: Vec<Message> = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line.with_context(|| format!("reading {}", self.path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Record>(&line) {
                Ok(Record::Message { message, .. }) => view.push(message),
                Ok(Record::Trim { window, notice, .. }) => {
                    let tail = view.split_off(view.len().saturating_sub(window));
                    view = std::iter::once(notice).chain(sanitize(tail)).collect();
                }
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        line = index + 1,
                        "Skipping unreadable transcript record: {}",
                        e
                    );
                }
            }
        }
        Ok(view)
    }
}

/// 文件非空且最后一个字节不是换行
fn ends_mid_line(file: &mut File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

#[async_trait]
impl TranscriptStore for JsonlTranscriptStore {
    async fn load_recent(&self, limit: usize) -> anyhow::Result<Vec<Message>> {
        let _guard = self.write_lock.lock().await;
        let mut view = self.materialize()?;
        let start = view.len().saturating_sub(limit);
        Ok(view.split_off(start))
    }

    async fn append_many(&self, messages: &[Message]) -> anyhow::Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let ts = Utc::now();
        let records: Vec<Record> = messages
            .iter()
            .cloned()
            .map(|message| Record::Message { ts, message })
            .collect();
        let _guard = self.write_lock.lock().await;
        self.append_records(&records)
    }

    async fn record_trim(&self, window: usize, notice: &Message) -> anyhow::Result<()> {
        let record = Record::Trim {
            ts: Utc::now(),
            window,
            notice: notice.clone(),
        };
        let _guard = self.write_lock.lock().await;
        self.append_records(std::slice::from_ref(&record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ToolCall, ToolResult};

    #[tokio::test]
    async fn test_load_recent_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlTranscriptStore::for_agent(dir.path(), "agent");
        assert!(store.load_recent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_then_load_recent_tail() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlTranscriptStore::for_agent(dir.path(), "agent");
        let msgs: Vec<Message> = (0..5).map(|i| Message::user(format!("m{i}"))).collect();
        store.append_many(&msgs[..3]).await.unwrap();
        store.append_many(&msgs[3..]).await.unwrap();

        let recent = store.load_recent(2).await.unwrap();
        assert_eq!(recent, msgs[3..].to_vec());
        assert_eq!(store.load_recent(100).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_torn_last_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlTranscriptStore::for_agent(dir.path(), "agent");
        store.append_many(&[Message::user("ok")]).await.unwrap();
        let mut f = OpenOptions::new().append(true).open(store.path()).unwrap();
        f.write_all(b"{\"kind\":\"message\",\"ts\":\"20").unwrap();

        let recent = store.load_recent(10).await.unwrap();
        assert_eq!(recent, vec![Message::user("ok")]);
    }

    #[tokio::test]
    async fn test_append_after_torn_line_starts_a_new_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlTranscriptStore::for_agent(dir.path(), "agent");
        store.append_many(&[Message::user("ok")]).await.unwrap();
        let mut f = OpenOptions::new().append(true).open(store.path()).unwrap();
        f.write_all(b"{\"kind\":\"message\",\"ts\":\"20").unwrap();
        drop(f);

        store.append_many(&[Message::user("after restart")]).await.unwrap();
        let notice = Message::user("[context trimmed]");
        store.record_trim(1, &notice).await.unwrap();

        let recent = store.load_recent(10).await.unwrap();
        assert_eq!(recent, vec![notice, Message::user("after restart")]);
    }

    #[tokio::test]
    async fn test_trim_checkpoint_materializes_window() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlTranscriptStore::for_agent(dir.path(), "agent");
        let msgs = vec![
            Message::user("old"),
            Message::assistant_turn(None, vec![ToolCall::new("c1", "t", serde_json::json!({}))], None),
            Message::tool_results(vec![ToolResult::ok("c1", "done".into())]),
            Message::assistant("latest"),
        ];
        store.append_many(&msgs).await.unwrap();
        let notice = Message::user("[context trimmed]");
        // 窗口 2：tool_results + assistant，sanitize 后孤立的 tool_results 被丢弃
        store.record_trim(2, &notice).await.unwrap();
        store.append_many(&[Message::user("next")]).await.unwrap();

        let recent = store.load_recent(10).await.unwrap();
        assert_eq!(
            recent,
            vec![notice, Message::assistant("latest"), Message::user("next")]
        );
    }
}
