//! 工具执行器
//!
//! 持有 ToolRegistry 与 ToolSandbox：按名查找工具，取出其资源声明，
//! 把调用器交给沙箱走「评估 → 审批 → 约束执行 → 审计」。
//! 未注册的工具名不经过沙箱，直接返回 HallucinatedTool。

use std::sync::Arc;

use serde_json::Value;

use crate::core::{AgentError, TaskContext};
use crate::security::{ApprovalResponse, SandboxResult, ToolSandbox};
use crate::tools::{Tool, ToolRegistry};

pub struct ToolExecutor {
    registry: ToolRegistry,
    sandbox: Arc<ToolSandbox>,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, sandbox: Arc<ToolSandbox>) -> Self {
        Self { registry, sandbox }
    }

    pub async fn execute(
        &self,
        task: &TaskContext,
        actor: &str,
        tool_name: &str,
        args: Value,
    ) -> Result<SandboxResult, AgentError> {
        let tool = self
            .registry
            .get(tool_name)
            .ok_or_else(|| AgentError::HallucinatedTool(tool_name.to_string()))?;
        let resources = tool.resources(&args);
        let invoker = self
            .registry
            .invoker(tool_name, args.clone())
            .ok_or_else(|| AgentError::HallucinatedTool(tool_name.to_string()))?;
        Ok(self
            .sandbox
            .execute(task, actor, tool_name, args, resources, invoker)
            .await)
    }

    pub async fn escalate(
        &self,
        task: &TaskContext,
        actor: &str,
        tool_name: &str,
        args: Value,
        error: &AgentError,
    ) -> Result<Option<ApprovalResponse>, AgentError> {
        self.sandbox.escalate(task, actor, tool_name, args, error).await
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn sandbox(&self) -> &Arc<ToolSandbox> {
        &self.sandbox
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }
}
