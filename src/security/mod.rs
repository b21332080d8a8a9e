//! 工具执行安全层：规则、评估、审批、沙箱执行与审计

pub mod approval;
pub mod audit;
pub mod evaluator;
pub mod pattern;
pub mod sandbox;
pub mod store;
pub mod types;

pub use approval::{ApprovalHook, ApprovalManager, ApprovalRecord, ApprovalRequest, ApprovalResponse};
pub use audit::{AuditEntry, AuditFilter, AuditLogger, AuditOutcome, InMemoryAuditLog, JsonlAuditLog};
pub use evaluator::{evaluate, PermissionEvaluation, PermissionEvaluator, PermissionPolicy, SecurityConfig};
pub use pattern::{glob_match, GlobPattern};
pub use sandbox::{SandboxResult, ToolSandbox};
pub use store::PermissionStore;
pub use types::{
    AccessType, DecisionState, ExecutionConstraints, PermissionLevel, ResourceRequest, ResourceType,
    SecurityContext, SecurityPermission,
};
