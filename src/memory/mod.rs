//! 记忆层：任务对话日志

pub mod conversation;

pub use conversation::{ConversationLog, Message, Role};
