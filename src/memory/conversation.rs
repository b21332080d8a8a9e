//! 任务对话日志
//!
//! 记录任务内模型与工具之间往返的消息，供下一轮规划与检查点序列化使用；
//! 超出 max_messages 时丢弃最旧的消息（0 表示不限制）。

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致，Tool 表示工具观察结果）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// 工具观察：格式化为 "[tool] 内容"
    pub fn tool(tool: &str, content: impl AsRef<str>) -> Self {
        Self {
            role: Role::Tool,
            content: format!("[{}] {}", tool, content.as_ref()),
        }
    }
}

/// 任务级对话日志
#[derive(Clone, Debug, Default)]
pub struct ConversationLog {
    messages: Vec<Message>,
    max_messages: usize,
}

impl ConversationLog {
    pub fn new(max_messages: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_messages,
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
        self.prune();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// 用检查点中的消息整体替换
    pub fn replace(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.prune();
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn prune(&mut self) {
        if self.max_messages > 0 && self.messages.len() > self.max_messages {
            let excess = self.messages.len() - self.max_messages;
            self.messages.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prune_keeps_latest() {
        let mut log = ConversationLog::new(2);
        log.push(Message::user("a"));
        log.push(Message::assistant("b"));
        log.push(Message::tool("echo", "c"));
        assert_eq!(log.len(), 2);
        assert_eq!(log.messages()[0].content, "b");
        assert_eq!(log.messages()[1].content, "[echo] c");
    }

    #[test]
    fn test_unbounded_when_zero() {
        let mut log = ConversationLog::new(0);
        for i in 0..50 {
            log.push(Message::user(i.to_string()));
        }
        assert_eq!(log.len(), 50);
    }
}
