//! 上下文管理：把 Transcript 收敛为有界、结构合法的请求
//!
//! 两个相互独立、可组合的裁剪过程：
//! - 稳态裁剪（trim_steady）：每次提交后执行，消息数超过上限时丢弃最旧部分并插入提示，结果写回 Transcript；
//! - 请求前压缩（build_request）：只作用于本次请求副本，先截断超长单条，再按字符预算从头部整条移除。
//!
//! 任何裁剪之后都要重新 sanitize：不允许以孤立的 tool_results 或无文本的 assistant 消息开头。

use crate::llm::{ModelRequest, ToolSpec};
use crate::memory::{Message, Role};

/// 上下文预算配置
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Transcript 最大消息数（稳态）
    pub max_messages: usize,
    /// 单条文本 / 单个工具结果的最大字符数
    pub max_message_chars: usize,
    /// 请求总字符预算（system + 全部消息）
    pub max_total_chars: usize,
    /// 预算裁剪时至少保留的消息数
    pub min_window: usize,
    /// 稳态裁剪提示中指向持久知识的位置
    pub knowledge_hint: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_messages: 100,
            max_message_chars: 20_000,
            max_total_chars: 400_000,
            min_window: 4,
            knowledge_hint: "Consult your notes and workspace files for anything older.".to_string(),
        }
    }
}

/// 稳态裁剪结果
#[derive(Debug, Clone)]
pub struct SteadyTrim {
    /// 裁剪后的完整 Transcript（首条为提示）
    pub messages: Vec<Message>,
    /// 被移除的消息数
    pub dropped: usize,
    /// sanitize 之前保留的尾部窗口大小（写入存储检查点）
    pub window: usize,
    pub notice: Message,
}

/// 请求前压缩的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// 被截断文本的消息数
    pub truncated_messages: usize,
    /// 为满足预算整条移除的消息数
    pub dropped_messages: usize,
    /// 最终估算字符数（不含压缩提示本身）
    pub estimated_chars: usize,
    /// 已到最小窗口仍超预算，按原样发送
    pub over_budget: bool,
}

/// 头部是否可以作为 Transcript 的第一条消息
fn is_valid_head(msg: &Message) -> bool {
    if msg.has_tool_results() {
        return false;
    }
    !(msg.role == Role::Assistant && !msg.has_text())
}

/// 恢复结构不变式：
/// 1. 丢弃与前一条 assistant 的 tool_calls 不匹配的 tool_results 消息；
/// 2. 去掉其后没有对应结果的 tool_calls（有文本则保留文本，替换为新消息）；
/// 3. 从头部丢弃，直到首条为自由文本消息。
///
/// 幂等：`sanitize(sanitize(m)) == sanitize(m)`。
pub fn sanitize(messages: Vec<Message>) -> Vec<Message> {
    let mut paired: Vec<Message> = Vec::with_capacity(messages.len());
    for msg in messages {
        if msg.has_tool_results() {
            match paired.last() {
                Some(prev) if msg.answers(prev) => paired.push(msg),
                _ => continue,
            }
        } else {
            paired.push(msg);
        }
    }

    let mut out: Vec<Message> = Vec::with_capacity(paired.len());
    let mut iter = paired.into_iter().peekable();
    while let Some(msg) = iter.next() {
        if msg.has_tool_calls() {
            let answered = iter.peek().is_some_and(|next| next.answers(&msg));
            if !answered {
                if msg.has_text() {
                    out.push(Message {
                        tool_calls: Vec::new(),
                        ..msg
                    });
                }
                continue;
            }
        }
        out.push(msg);
    }

    let start = out.iter().position(is_valid_head).unwrap_or(out.len());
    out.split_off(start)
}

/// 保留后缀截断：超过 `max_chars` 时只保留最后 `max_chars` 个字符，并在前面加截断说明
pub fn truncate_keep_suffix(text: &str, max_chars: usize) -> Option<String> {
    let total = text.chars().count();
    if total <= max_chars {
        return None;
    }
    let dropped = total - max_chars;
    let cut = text
        .char_indices()
        .nth(dropped)
        .map_or(text.len(), |(idx, _)| idx);
    Some(format!(
        "[... {dropped} earlier characters truncated ...]\n{}",
        &text[cut..]
    ))
}

/// 上下文管理器
#[derive(Debug, Clone, Default)]
pub struct ContextManager {
    config: ContextConfig,
}

impl ContextManager {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// 稳态裁剪；未超过上限时返回 None
    pub fn trim_steady(&self, messages: &[Message]) -> Option<SteadyTrim> {
        let max = self.config.max_messages.max(1);
        if messages.len() <= max {
            return None;
        }
        let window = max - 1;
        let tail = messages[messages.len() - window..].to_vec();
        let kept = sanitize(tail);
        let dropped = messages.len() - kept.len();
        let notice = Message::user(format!(
            "[context trimmed] {} older messages were removed from this transcript. {}",
            dropped, self.config.knowledge_hint
        ));
        let mut trimmed = Vec::with_capacity(kept.len() + 1);
        trimmed.push(notice.clone());
        trimmed.extend(kept);
        Some(SteadyTrim {
            messages: trimmed,
            dropped,
            window,
            notice,
        })
    }

    /// 截断单条消息的文本与工具结果（不修改原消息）
    fn truncate_message(&self, msg: &Message) -> Option<Message> {
        let max = self.config.max_message_chars;
        let text = msg
            .text
            .as_deref()
            .and_then(|t| truncate_keep_suffix(t, max));
        let mut results_changed = false;
        let results = msg
            .tool_results
            .iter()
            .map(|r| match truncate_keep_suffix(r.output.as_text(), max) {
                Some(short) => {
                    results_changed = true;
                    let mut r = r.clone();
                    r.output = r.output.with_text(short);
                    r
                }
                None => r.clone(),
            })
            .collect::<Vec<_>>();
        if text.is_none() && !results_changed {
            return None;
        }
        let mut out = msg.clone();
        if text.is_some() {
            out.text = text;
        }
        out.tool_results = results;
        Some(out)
    }

    /// 构建本次请求：逐条截断 + 总预算裁剪 + sanitize，不影响持久 Transcript
    pub fn build_request(
        &self,
        system: &str,
        messages: &[Message],
        tools: Vec<ToolSpec>,
    ) -> (ModelRequest, CompactionReport) {
        let mut report = CompactionReport::default();
        let mut window: Vec<Message> = messages
            .iter()
            .map(|m| match self.truncate_message(m) {
                Some(short) => {
                    report.truncated_messages += 1;
                    short
                }
                None => m.clone(),
            })
            .collect();

        let system_chars = system.chars().count();
        let mut total = system_chars + window.iter().map(Message::char_len).sum::<usize>();
        let mut start = 0;
        while total > self.config.max_total_chars && window.len() - start > self.config.min_window
        {
            total -= window[start].char_len();
            start += 1;
        }

        if start > 0 {
            let original = window.len();
            let kept = sanitize(window.split_off(start));
            report.dropped_messages = original - kept.len();
            total = system_chars + kept.iter().map(Message::char_len).sum::<usize>();
            // 提示在预算裁剪之后插入，保证其自身不会被裁掉
            let notice = Message::user(format!(
                "[context compacted] {} earlier messages were omitted from this request to fit the context budget.",
                report.dropped_messages
            ));
            window = std::iter::once(notice).chain(kept).collect();
        }

        report.estimated_chars = total;
        report.over_budget = total > self.config.max_total_chars;
        if report.over_budget {
            tracing::warn!(
                estimated_chars = total,
                budget = self.config.max_total_chars,
                "Request exceeds context budget at minimum window, sending anyway"
            );
        }

        let request = ModelRequest {
            system: system.to_string(),
            messages: window,
            tools,
        };
        (request, report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ToolCall, ToolResult};
    use serde_json::json;

    fn calls(ids: &[&str]) -> Message {
        Message::assistant_turn(
            None,
            ids.iter().map(|id| ToolCall::new(*id, "t", json!({}))).collect(),
            None,
        )
    }

    fn results(ids: &[&str]) -> Message {
        Message::tool_results(ids.iter().map(|id| ToolResult::ok(*id, "r".into())).collect())
    }

    /// 小字母表上的全部序列，用来检查 sanitize 的性质
    fn alphabet() -> Vec<Message> {
        vec![
            Message::user("u"),
            Message::assistant("a"),
            calls(&["x"]),
            results(&["x"]),
            calls(&["x", "y"]),
            results(&["x", "y"]),
            results(&["y"]),
            Message::assistant_turn(Some("t".into()), vec![ToolCall::new("x", "t", json!({}))], None),
            Message::assistant_turn(None, vec![], Some(json!({"trace": 1}))),
        ]
    }

    fn all_sequences(max_len: usize) -> Vec<Vec<Message>> {
        let alpha = alphabet();
        let mut all: Vec<Vec<Message>> = vec![vec![]];
        let mut frontier: Vec<Vec<Message>> = vec![vec![]];
        for _ in 0..max_len {
            let mut next = Vec::new();
            for s in &frontier {
                for m in &alpha {
                    let mut s2 = s.clone();
                    s2.push(m.clone());
                    next.push(s2);
                }
            }
            all.extend(next.iter().cloned());
            frontier = next;
        }
        all
    }

    fn assert_pairing(seq: &[Message]) {
        for (i, m) in seq.iter().enumerate() {
            if m.has_tool_results() {
                assert!(i > 0, "leading tool results in {seq:?}");
                assert!(m.answers(&seq[i - 1]), "unpaired results in {seq:?}");
            }
            if m.has_tool_calls() {
                assert!(
                    seq.get(i + 1).is_some_and(|n| n.answers(m)),
                    "dangling calls in {seq:?}"
                );
            }
        }
    }

    #[test]
    fn test_sanitize_idempotent_and_paired() {
        for seq in all_sequences(4) {
            let once = sanitize(seq.clone());
            let twice = sanitize(once.clone());
            assert_eq!(once, twice, "not idempotent for {seq:?}");
            assert_pairing(&once);
            if let Some(head) = once.first() {
                assert!(is_valid_head(head));
            }
        }
    }

    #[test]
    fn test_sanitize_drops_orphaned_leading_results() {
        let seq = vec![results(&["x"]), Message::assistant("a"), Message::user("u")];
        assert_eq!(
            sanitize(seq),
            vec![Message::assistant("a"), Message::user("u")]
        );
    }

    #[test]
    fn test_sanitize_keeps_valid_pairs() {
        let seq = vec![Message::user("go"), calls(&["x", "y"]), results(&["x", "y"])];
        assert_eq!(sanitize(seq.clone()), seq);
    }

    #[test]
    fn test_sanitize_strips_unanswered_calls_but_keeps_text() {
        let with_text =
            Message::assistant_turn(Some("thinking".into()), vec![ToolCall::new("x", "t", json!({}))], None);
        let seq = vec![Message::user("go"), with_text, Message::user("next")];
        let out = sanitize(seq);
        assert_eq!(out.len(), 3);
        assert_eq!(out[1].text.as_deref(), Some("thinking"));
        assert!(out[1].tool_calls.is_empty());
    }

    #[test]
    fn test_trim_steady_bounds_length_and_prepends_notice() {
        let cm = ContextManager::new(ContextConfig {
            max_messages: 10,
            ..Default::default()
        });
        let mut msgs = Vec::new();
        for i in 0..6 {
            msgs.push(Message::user(format!("u{i}")));
            msgs.push(Message::assistant(format!("a{i}")));
        }
        assert!(cm.trim_steady(&msgs[..10]).is_none());

        let trim = cm.trim_steady(&msgs).unwrap();
        assert!(trim.messages.len() <= 10);
        assert_eq!(trim.messages[0], trim.notice);
        assert!(trim.notice.text.as_deref().unwrap().starts_with("[context trimmed]"));
        assert_eq!(trim.window, 9);
        // 尾部窗口以 a1 开头，本身合法，只丢最旧的 3 条
        assert_eq!(trim.dropped, 3);
        assert_eq!(trim.messages.last(), msgs.last());
    }

    #[test]
    fn test_trim_steady_resanitizes_split_pair() {
        let cm = ContextManager::new(ContextConfig {
            max_messages: 3,
            ..Default::default()
        });
        // 窗口 2 = [results, assistant]，results 失去配对被丢弃
        let msgs = vec![
            Message::user("go"),
            calls(&["x"]),
            results(&["x"]),
            Message::assistant("done"),
        ];
        let trim = cm.trim_steady(&msgs).unwrap();
        assert_eq!(trim.messages.len(), 2);
        assert_eq!(trim.messages[1], Message::assistant("done"));
        assert_eq!(trim.dropped, 3);
    }

    #[test]
    fn test_truncate_keep_suffix() {
        assert_eq!(truncate_keep_suffix("short", 10), None);
        let out = truncate_keep_suffix("abcdefghij", 4).unwrap();
        assert!(out.ends_with("\nghij"));
        assert!(out.contains("6 earlier characters truncated"));
        // 多字节字符按字符而非字节截断
        let out = truncate_keep_suffix("你好世界", 2).unwrap();
        assert!(out.ends_with("世界"));
    }

    #[test]
    fn test_build_request_truncates_long_tool_output() {
        let cm = ContextManager::new(ContextConfig {
            max_message_chars: 5,
            ..Default::default()
        });
        let msgs = vec![
            Message::user("go"),
            calls(&["x"]),
            Message::tool_results(vec![ToolResult::ok("x", "0123456789".into())]),
        ];
        let (req, report) = cm.build_request("sys", &msgs, vec![]);
        assert_eq!(report.truncated_messages, 1);
        assert_eq!(report.dropped_messages, 0);
        let text = req.messages[2].tool_results[0].output.as_text();
        assert!(text.ends_with("56789"));
        // 原始 Transcript 不受影响
        assert_eq!(msgs[2].tool_results[0].output.as_text(), "0123456789");
    }

    #[test]
    fn test_build_request_drops_oldest_to_fit_budget() {
        let cm = ContextManager::new(ContextConfig {
            max_message_chars: 1_000,
            max_total_chars: 250,
            min_window: 2,
            ..Default::default()
        });
        let big = "x".repeat(100);
        let msgs = vec![
            Message::user(big.clone()),
            Message::assistant(big.clone()),
            Message::user(big.clone()),
            Message::assistant("tail"),
        ];
        let (req, report) = cm.build_request("", &msgs, vec![]);
        // 移除首条后 204 <= 250
        assert_eq!(report.dropped_messages, 1);
        assert!(!report.over_budget);
        assert!(req.messages[0]
            .text
            .as_deref()
            .unwrap()
            .starts_with("[context compacted]"));
        assert_eq!(req.messages.len(), 4);
        assert_eq!(req.messages.last(), msgs.last());
    }

    #[test]
    fn test_build_request_budget_cut_between_call_and_result_resanitizes() {
        let cm = ContextManager::new(ContextConfig {
            max_message_chars: 1_000,
            max_total_chars: 110,
            min_window: 2,
            ..Default::default()
        });
        let big = "x".repeat(100);
        let msgs = vec![
            Message::user(big.clone()),
            Message::assistant_turn(None, vec![ToolCall::new("x", "t", json!({"p": big.clone()}))], None),
            results(&["x"]),
            Message::assistant(big.clone()),
            Message::user("tail"),
        ];
        let (req, report) = cm.build_request("", &msgs, vec![]);
        // 预算裁到 calls(x) 为止，孤立的 results(x) 由 sanitize 再丢掉一条
        assert_eq!(report.dropped_messages, 3);
        assert!(!report.over_budget);
        assert_eq!(req.messages.len(), 3);
        assert!(req.messages[0]
            .text
            .as_deref()
            .unwrap()
            .starts_with("[context compacted] 3 "));
        assert!(req.messages.iter().all(|m| !m.has_tool_results()));
        assert_eq!(req.messages[1..], msgs[3..]);
        assert_pairing(&req.messages);
    }

    #[test]
    fn test_build_request_sends_oversized_at_min_window() {
        let cm = ContextManager::new(ContextConfig {
            max_message_chars: 1_000,
            max_total_chars: 10,
            min_window: 2,
            ..Default::default()
        });
        let msgs = vec![Message::user("x".repeat(50)), Message::assistant("y".repeat(50))];
        let (req, report) = cm.build_request("", &msgs, vec![]);
        assert!(report.over_budget);
        assert_eq!(report.dropped_messages, 0);
        assert_eq!(req.messages, msgs);
    }
}
