//! 内存中的对话记录（Transcript）
//!
//! 由 Turn Engine 独占；只追加或整体替换，从不原地修改已有消息。

use crate::memory::{Message, Role};

/// 有序消息序列
#[derive(Clone, Debug, Default)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    /// 整体替换（裁剪之后使用）
    pub fn replace(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// 下一条提交是否需要一条 user 消息来保持角色交替
    pub fn needs_user_turn(&self) -> bool {
        self.messages.last().map_or(true, |m| m.role != Role::User)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_user_turn() {
        let mut t = Transcript::new();
        assert!(t.needs_user_turn());
        t.push(Message::user("hi"));
        assert!(!t.needs_user_turn());
        t.push(Message::assistant("hello"));
        assert!(t.needs_user_turn());
    }
}
