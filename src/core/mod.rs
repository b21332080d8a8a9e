//! 核心编排层：任务/Agent 上下文生命周期、执行链、检查点、错误恢复与优雅关闭

pub mod agent_context;
pub mod chain;
pub mod checkpoint;
pub mod debounce;
pub mod error;
pub mod operations;
pub mod recovery;
pub mod shutdown;
pub mod task_context;

pub use agent_context::{AgentContext, DEFAULT_MAX_CONSECUTIVE_ERRORS};
pub use chain::{AgentProgress, ChainEntry, ExecutionChain, ToolCallRecord, ToolCallStatus};
pub use checkpoint::{CheckpointSink, FileCheckpointSink, TaskCheckpoint};
pub use debounce::{StateChangeHook, StateDebouncer};
pub use error::{AgentError, ErrorCategory, RecoveryAction};
pub use operations::{OperationGuard, OperationRegistry};
pub use recovery::{ErrorClassifier, FixedClassifier, RecoveryEngine};
pub use shutdown::{
    run_with_graceful_shutdown, CheckpointCleanup, ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
pub use task_context::{PauseLevel, TaskContext, TaskSettings};
