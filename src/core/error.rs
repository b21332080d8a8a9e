//! 编排错误类型与恢复动作
//!
//! 与 ErrorClassifier 配合：工具执行失败时决定 Retry / Skip / Escalate / Continue。
//! 只有 ExecutionFailed 类别的错误会进入恢复策略，其余类别直接上抛。

use thiserror::Error;

/// 任务编排过程中可能出现的错误（取消、策略拒绝、工具失败、容量超限等）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    /// 任务已被中止；任何层都不得吞掉该错误
    #[error("Task cancelled")]
    Cancelled,

    #[error("Policy denied tool '{tool}': {reason}")]
    PolicyDenied { tool: String, reason: String },

    #[error("Approval required for tool '{0}' but no approval channel is configured")]
    ApprovalUnavailable(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool '{tool}' timed out after {timeout_ms}ms")]
    ToolTimeout { tool: String, timeout_ms: u64 },

    /// 硬暂停打断了正在执行的工具，按可重试处理
    #[error("Tool '{0}' interrupted by hard pause")]
    ToolInterrupted(String),

    #[error("Consecutive error limit exceeded ({consecutive_errors}/{limit})")]
    CapacityExceeded { consecutive_errors: u32, limit: u32 },

    #[error("Invalid permission pattern: {0}")]
    InvalidPattern(String),

    #[error("Hallucinated tool: {0}")]
    HallucinatedTool(String),

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Config error: {0}")]
    ConfigError(String),
}

/// 错误大类：决定传播与重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Cancelled,
    PolicyDenied,
    ExecutionFailed,
    ApprovalUnavailable,
    CapacityExceeded,
    Other,
}

impl AgentError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            AgentError::Cancelled => ErrorCategory::Cancelled,
            AgentError::PolicyDenied { .. } => ErrorCategory::PolicyDenied,
            AgentError::ApprovalUnavailable(_) => ErrorCategory::ApprovalUnavailable,
            AgentError::ToolExecutionFailed(_)
            | AgentError::ToolTimeout { .. }
            | AgentError::ToolInterrupted(_) => ErrorCategory::ExecutionFailed,
            AgentError::CapacityExceeded { .. } => ErrorCategory::CapacityExceeded,
            _ => ErrorCategory::Other,
        }
    }

    /// 只有执行失败允许进入 retry/skip/escalate/continue 策略
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::ExecutionFailed
    }

    /// 是否属于策略拒绝（ApprovalUnavailable 视同 PolicyDenied）
    pub fn is_policy_denial(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::PolicyDenied | ErrorCategory::ApprovalUnavailable
        )
    }
}

/// 错误分类钩子给出的处理动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 重新执行同一工具调用（受单次调用重试上限约束）
    Retry,
    /// 视为工具返回空结果，继续
    Skip,
    /// 交给人工处理，任务挂起而非中止
    Escalate,
    /// 把错误作为 Observation 交给模型自行决定
    Continue,
}
