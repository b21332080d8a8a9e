//! 错误恢复
//!
//! 工具执行失败时由 ErrorClassifier 给出 RecoveryAction，Agent 循环据此决定重试、跳过、升级还是继续。
//! 分类器的回答只是建议：单次调用重试上限与连续错误上限由循环自身强制执行。

use async_trait::async_trait;
use serde_json::Value;

use crate::core::agent_context::AgentContext;
use crate::core::{AgentError, RecoveryAction};

/// 错误分类钩子
#[async_trait]
pub trait ErrorClassifier: Send + Sync {
    async fn classify(
        &self,
        agent: &AgentContext,
        tool_name: &str,
        error: &AgentError,
        args: &Value,
    ) -> RecoveryAction;
}

/// 默认分类：瞬时性失败（超时、被硬暂停打断）重试，其余交给模型
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        match err {
            AgentError::ToolTimeout { .. } | AgentError::ToolInterrupted(_) => RecoveryAction::Retry,
            AgentError::ToolExecutionFailed(_) => RecoveryAction::Continue,
            _ => RecoveryAction::Continue,
        }
    }
}

#[async_trait]
impl ErrorClassifier for RecoveryEngine {
    async fn classify(
        &self,
        _agent: &AgentContext,
        _tool_name: &str,
        error: &AgentError,
        _args: &Value,
    ) -> RecoveryAction {
        self.handle(error)
    }
}

/// 固定返回同一动作的分类器，便于配置成「总是跳过」等策略
#[derive(Debug, Clone, Copy)]
pub struct FixedClassifier(pub RecoveryAction);

#[async_trait]
impl ErrorClassifier for FixedClassifier {
    async fn classify(&self, _: &AgentContext, _: &str, _: &AgentError, _: &Value) -> RecoveryAction {
        self.0
    }
}
