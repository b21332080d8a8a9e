//! LLM 客户端抽象
//!
//! 模型调用层不在本 crate 内实现，Agent 循环只依赖这个 trait。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{stream, Stream};

use crate::memory::Message;

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, String>> + Send>>;

/// LLM 客户端 trait：非流式完成与流式完成（返回 Token 流）
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String, String>;

    /// 默认把 complete 的结果包成单元素流
    async fn complete_stream(&self, messages: &[Message]) -> Result<TokenStream, String> {
        let content = self.complete(messages).await?;
        Ok(Box::pin(stream::iter(vec![Ok(content)])))
    }
}
