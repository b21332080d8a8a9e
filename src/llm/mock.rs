//! 脚本化 LLM 客户端（测试与演示用，无需 API）
//!
//! 按顺序吐出预设输出；脚本耗尽后返回固定的结束语。

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::llm::LlmClient;
use crate::memory::Message;

#[derive(Debug)]
pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<Result<String, String>>>,
    final_answer: String,
    calls: Mutex<Vec<usize>>,
}

impl ScriptedLlmClient {
    pub fn new<I, S>(outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Mutex::new(outputs.into_iter().map(|s| Ok(s.into())).collect()),
            final_answer: "Task complete.".to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_final_answer(mut self, answer: impl Into<String>) -> Self {
        self.final_answer = answer.into();
        self
    }

    /// 追加一次模型调用失败
    pub fn push_error(&self, error: impl Into<String>) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Err(error.into()));
    }

    /// 被调用次数
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// 每次调用时收到的消息条数
    pub fn prompt_sizes(&self) -> Vec<usize> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(messages.len());
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| Ok(self.final_answer.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_script_then_final_answer() {
        let client = ScriptedLlmClient::new([r#"{"tool":"echo","args":{}}"#]).with_final_answer("bye");
        assert!(client.complete(&[]).await.unwrap().contains("echo"));
        assert_eq!(client.complete(&[]).await.unwrap(), "bye");
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn test_pushed_error_is_returned_in_order() {
        let client = ScriptedLlmClient::new(["first"]);
        client.push_error("rate limited");
        assert_eq!(client.complete(&[]).await, Ok("first".to_string()));
        assert_eq!(client.complete(&[]).await, Err("rate limited".to_string()));
        assert_eq!(client.complete(&[]).await, Ok("Task complete.".to_string()));
    }

    #[tokio::test]
    async fn test_default_stream_wraps_complete() {
        let client = ScriptedLlmClient::new(["hello"]);
        let mut stream = client.complete_stream(&[]).await.unwrap();
        assert_eq!(stream.next().await, Some(Ok("hello".to_string())));
        assert_eq!(stream.next().await, None);
    }
}
