//! Agent 循环过程事件：供 CLI / 前端展示步数、工具调用、观察、恢复动作与最终回复

use serde::Serialize;

/// 单步过程事件（可序列化为 JSON）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReactEvent {
    StepUpdate {
        agent: String,
        step: usize,
        max_steps: usize,
    },
    /// 正在调用 LLM
    Thinking { agent: String },
    ToolCall {
        agent: String,
        tool: String,
        args: serde_json::Value,
        attempt: u32,
    },
    /// 工具返回（预览，避免过长）
    Observation {
        agent: String,
        tool: String,
        preview: String,
    },
    /// 工具失败或被拦截
    ToolFailure {
        agent: String,
        tool: String,
        reason: String,
    },
    /// 错误分类后的处理动作
    Recovery {
        agent: String,
        action: String,
        detail: String,
    },
    /// 任务因升级而挂起
    Parked { agent: String, tool: String },
    MessageDone { agent: String, text: String },
    Error { agent: String, text: String },
}
