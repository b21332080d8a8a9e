//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / resources / execute），由 ToolRegistry 按名注册与查找。
//! 工具自己不做权限判断：resources 声明本次调用要触及的资源，由沙箱据此评估。

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::security::ResourceRequest;

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、资源声明、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（用于 JSON 中的 "tool" 字段）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认返回空对象
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 本次调用会触及的资源，默认不声明
    fn resources(&self, _args: &Value) -> Vec<ResourceRequest> {
        Vec::new()
    }

    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 沙箱消费的已装箱工具 future
pub type ToolFuture = Pin<Box<dyn Future<Output = Result<String, String>> + Send>>;

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// 零参数调用器，交给沙箱在授权后执行
    pub fn invoker(
        &self,
        name: &str,
        args: Value,
    ) -> Option<impl FnOnce() -> ToolFuture + Send> {
        let tool = self.get(name)?;
        Some(move || -> ToolFuture { Box::pin(async move { tool.execute(args).await }) })
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 工具 schema JSON，拼入 system prompt
    pub fn to_schema_json(&self) -> String {
        let tools: Vec<Value> = self
            .tool_names()
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| {
                serde_json::json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "parameters": tool.parameters_schema()
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}
