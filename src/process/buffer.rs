//! 有上限的输出缓冲：按字符计数，超过上限时从头部丢弃，始终保留最新输出

use serde::{Deserialize, Serialize};

/// 输出缓冲
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BufferRepr", into = "BufferRepr")]
pub struct OutputBuffer {
    content: String,
    cap: usize,
    len_chars: usize,
    /// 累计从头部丢弃的字符数
    dropped: u64,
}

/// 持久化形态：只保存文本与丢弃计数，上限由运行时重新施加
#[derive(Serialize, Deserialize)]
struct BufferRepr {
    #[serde(default)]
    text: String,
    #[serde(default)]
    dropped_chars: u64,
}

impl From<BufferRepr> for OutputBuffer {
    fn from(repr: BufferRepr) -> Self {
        let len_chars = repr.text.chars().count();
        Self {
            content: repr.text,
            cap: usize::MAX,
            len_chars,
            dropped: repr.dropped_chars,
        }
    }
}

impl From<OutputBuffer> for BufferRepr {
    fn from(buf: OutputBuffer) -> Self {
        Self {
            text: buf.content,
            dropped_chars: buf.dropped,
        }
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

impl OutputBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            content: String::new(),
            cap,
            len_chars: 0,
            dropped: 0,
        }
    }

    /// 追加并按上限从头部丢弃
    pub fn push(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        self.content.push_str(chunk);
        self.len_chars += chunk.chars().count();
        self.enforce_cap();
    }

    /// 重新设置上限（恢复持久化状态后使用）
    pub fn set_cap(&mut self, cap: usize) {
        self.cap = cap;
        self.enforce_cap();
    }

    fn enforce_cap(&mut self) {
        if self.len_chars <= self.cap {
            return;
        }
        let excess = self.len_chars - self.cap;
        let cut = self
            .content
            .char_indices()
            .nth(excess)
            .map_or(self.content.len(), |(idx, _)| idx);
        self.content.drain(..cut);
        self.len_chars -= excess;
        self.dropped += excess as u64;
    }

    pub fn as_str(&self) -> &str {
        &self.content
    }

    /// 当前保留的字符数
    pub fn len_chars(&self) -> usize {
        self.len_chars
    }

    /// 历史总字符数（含已丢弃部分）
    pub fn total_chars(&self) -> u64 {
        self.dropped + self.len_chars as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len_chars == 0
    }

    /// 是否发生过头部丢弃
    pub fn has_dropped(&self) -> bool {
        self.dropped > 0
    }

    /// 最后 `n` 个字符；第二项表示是否有更早的内容没有返回
    pub fn tail(&self, n: usize) -> (String, bool) {
        if n >= self.len_chars {
            return (self.content.clone(), self.has_dropped());
        }
        let skip = self.len_chars - n;
        let cut = self
            .content
            .char_indices()
            .nth(skip)
            .map_or(self.content.len(), |(idx, _)| idx);
        (self.content[cut..].to_string(), true)
    }

    /// 只保留最后 `n` 个字符的副本（写入状态文件用）
    pub fn trimmed(&self, n: usize) -> Self {
        let mut copy = self.clone();
        copy.set_cap(n);
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cap_discards_front() {
        let mut buf = OutputBuffer::new(5);
        buf.push("abc");
        buf.push("defg");
        assert_eq!(buf.as_str(), "cdefg");
        assert_eq!(buf.len_chars(), 5);
        assert_eq!(buf.total_chars(), 7);
        assert!(buf.has_dropped());
    }

    #[test]
    fn test_cap_counts_chars_not_bytes() {
        let mut buf = OutputBuffer::new(3);
        buf.push("日本語テキスト");
        assert_eq!(buf.as_str(), "キスト");
    }

    #[test]
    fn test_tail() {
        let mut buf = OutputBuffer::new(100);
        buf.push("hello world");
        assert_eq!(buf.tail(5), ("world".to_string(), true));
        assert_eq!(buf.tail(50), ("hello world".to_string(), false));
    }

    #[test]
    fn test_persisted_form_keeps_drop_count() {
        let mut buf = OutputBuffer::new(4);
        buf.push("123456");
        let json = serde_json::to_value(buf.trimmed(2)).unwrap();
        assert_eq!(json["text"], "56");
        assert_eq!(json["dropped_chars"], 4);

        let back: OutputBuffer = serde_json::from_value(json).unwrap();
        assert_eq!(back.total_chars(), 6);
        assert!(back.tail(10).1);
    }
}
