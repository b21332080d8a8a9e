//! 工具执行沙箱
//!
//! 单次工具调用的完整流程：权限评估 → （可选）人工审批 → 约束下执行 → 审计。
//! 每条终止路径恰好写一条审计记录。沙箱本身不持有跨调用的可变状态，
//! 频率限制也是从审计日志中统计得出。

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::core::task_context::TaskContext;
use crate::core::AgentError;
use crate::security::approval::{ApprovalHook, ApprovalRecord, ApprovalRequest, ApprovalResponse};
use crate::security::audit::{AuditEntry, AuditFilter, AuditLogger, AuditOutcome};
use crate::security::evaluator::PermissionPolicy;
use crate::security::types::{
    DecisionState, ExecutionConstraints, PermissionLevel, ResourceRequest, SecurityContext,
};

/// 频率限制的统计窗口
const RATE_WINDOW_MS: i64 = 60_000;
/// 审计日志中参数预览的最大字符数
const ARGS_PREVIEW_CHARS: usize = 200;

/// 沙箱执行结果
#[derive(Debug, Clone)]
pub struct SandboxResult {
    pub execution_id: String,
    /// 是否通过了权限（及审批）
    pub allowed: bool,
    pub requires_approval: bool,
    /// 未走审批时为 None
    pub approved: Option<bool>,
    pub level: Option<PermissionLevel>,
    pub reason: String,
    pub outcome: AuditOutcome,
    pub result: Option<String>,
    pub error: Option<AgentError>,
    pub duration_ms: u64,
}

impl SandboxResult {
    pub fn is_success(&self) -> bool {
        self.outcome == AuditOutcome::Success
    }

    pub fn into_result(self) -> Result<String, AgentError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or_default()),
        }
    }
}

pub struct ToolSandbox {
    policy: Arc<dyn PermissionPolicy>,
    approval: Option<Arc<dyn ApprovalHook>>,
    audit: Arc<dyn AuditLogger>,
}

impl ToolSandbox {
    pub fn new(policy: Arc<dyn PermissionPolicy>, audit: Arc<dyn AuditLogger>) -> Self {
        Self {
            policy,
            approval: None,
            audit,
        }
    }

    pub fn with_approval_hook(mut self, hook: Arc<dyn ApprovalHook>) -> Self {
        self.approval = Some(hook);
        self
    }

    pub fn audit(&self) -> &Arc<dyn AuditLogger> {
        &self.audit
    }

    pub fn policy(&self) -> &Arc<dyn PermissionPolicy> {
        &self.policy
    }

    /// 执行一次工具调用；invoker 只有在权限与审批都通过后才会被调用
    pub async fn execute<F, Fut>(
        &self,
        task: &TaskContext,
        actor: &str,
        tool_name: &str,
        args: Value,
        resources: Vec<ResourceRequest>,
        invoker: F,
    ) -> SandboxResult
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<String, String>> + Send,
    {
        let start = Instant::now();
        let task_token = task.cancellation_token();
        let mut ctx = SecurityContext::new(task.task_id(), actor, tool_name, args, resources);

        // 1. 权限评估；评估本身出错视为拒绝
        let evaluation = match self
            .policy
            .evaluate(actor, tool_name, &ctx.args, &ctx.requested_resources)
        {
            Ok(evaluation) => evaluation,
            Err(err) => {
                ctx.decision = DecisionState::Denied;
                ctx.reason = format!("permission evaluation failed: {}", err);
                return self.finish(ctx, AuditOutcome::Failed, None, Err(err), start);
            }
        };
        let level = evaluation.level;
        ctx.effective_permission = Some(level);
        ctx.reason = evaluation.reason.clone();

        if level == PermissionLevel::Deny {
            ctx.decision = DecisionState::Denied;
            let err = AgentError::PolicyDenied {
                tool: tool_name.to_string(),
                reason: evaluation.reason,
            };
            return self.finish(ctx, AuditOutcome::Blocked, None, Err(err), start);
        }

        // 2. 约束：基础超时 ∪ 规则约束 ∪（Sandbox 级别的超时上限）
        let config = self.policy.config();
        let mut constraints = ExecutionConstraints::default()
            .with_timeout_ms(config.default_timeout_ms)
            .merge(&evaluation.constraints);
        if level == PermissionLevel::Sandbox {
            constraints = constraints.merge(&ExecutionConstraints::default().with_timeout_ms(config.sandbox_timeout_ms));
        }
        ctx.applied_constraints = constraints.clone();

        if let Some(limit) = constraints.max_calls_per_minute {
            let recent = self.recent_executions(task.task_id(), tool_name);
            if recent >= limit as usize {
                ctx.decision = DecisionState::Denied;
                ctx.reason = format!("{}; rate limit {} calls/min exceeded", ctx.reason, limit);
                let err = AgentError::PolicyDenied {
                    tool: tool_name.to_string(),
                    reason: ctx.reason.clone(),
                };
                return self.finish(ctx, AuditOutcome::Blocked, None, Err(err), start);
            }
        }

        // 3. 审批；没有审批通道时默认拒绝
        let mut approval_record = None;
        if level.requires_approval() {
            let Some(hook) = self.approval.as_ref() else {
                ctx.decision = DecisionState::Denied;
                ctx.reason = format!("{}; no approval channel configured", ctx.reason);
                let err = AgentError::ApprovalUnavailable(tool_name.to_string());
                return self.finish(ctx, AuditOutcome::Blocked, None, Err(err), start);
            };
            let request = ApprovalRequest::from_context(&ctx, level, ctx.reason.clone());
            let response = tokio::select! {
                r = hook.request_approval(&ctx, &request) => Some(r),
                _ = task_token.cancelled() => None,
            };
            let Some(response) = response else {
                ctx.decision = DecisionState::Denied;
                return self.finish(ctx, AuditOutcome::Failed, None, Err(AgentError::Cancelled), start);
            };
            let response = response.unwrap_or_else(|e| {
                tracing::warn!(tool = tool_name, "Approval hook failed: {}", e);
                ApprovalResponse::rejected(format!("approval hook error: {}", e))
            });
            let record = ApprovalRecord::new(&request, &response);
            if !response.approved {
                ctx.decision = DecisionState::Denied;
                let feedback = response.feedback.unwrap_or_else(|| "no feedback".to_string());
                ctx.reason = format!("{}; approval rejected: {}", ctx.reason, feedback);
                let err = AgentError::PolicyDenied {
                    tool: tool_name.to_string(),
                    reason: ctx.reason.clone(),
                };
                let mut result = self.finish(ctx, AuditOutcome::Blocked, Some(record), Err(err), start);
                result.requires_approval = true;
                result.approved = Some(false);
                return result;
            }
            approval_record = Some(record);
        }

        // 4. 约束下执行：与超时、硬暂停、任务取消赛跑
        ctx.decision = DecisionState::Allowed;
        ctx.mark_started();
        let timeout = Duration::from_millis(constraints.timeout_ms.unwrap_or(config.default_timeout_ms));
        let (guard, op_token) = task.register_operation();
        let outcome = tokio::select! {
            biased;
            _ = op_token.cancelled() => {
                if task_token.is_cancelled() {
                    Err(AgentError::Cancelled)
                } else {
                    Err(AgentError::ToolInterrupted(tool_name.to_string()))
                }
            }
            r = tokio::time::timeout(timeout, invoker()) => match r {
                Ok(Ok(output)) => match constraints.max_output_bytes {
                    Some(max) if output.len() > max => Err(AgentError::ToolExecutionFailed(format!(
                        "output of {} bytes exceeds limit of {} bytes",
                        output.len(),
                        max
                    ))),
                    _ => Ok(output),
                },
                Ok(Err(msg)) => Err(AgentError::ToolExecutionFailed(msg)),
                Err(_) => Err(AgentError::ToolTimeout {
                    tool: tool_name.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                }),
            },
        };
        drop(guard);
        ctx.mark_completed();

        let audit_outcome = if outcome.is_ok() {
            AuditOutcome::Success
        } else {
            AuditOutcome::Failed
        };
        let approved = approval_record.as_ref().map(|r| r.approved);
        let mut result = self.finish(ctx, audit_outcome, approval_record, outcome, start);
        result.allowed = true;
        result.requires_approval = level.requires_approval();
        result.approved = approved;
        result
    }

    /// 执行失败后升级给人工；任务取消时记一条 Failed 并返回 Cancelled。没有审批通道时返回 None
    pub async fn escalate(
        &self,
        task: &TaskContext,
        actor: &str,
        tool_name: &str,
        args: Value,
        error: &AgentError,
    ) -> Result<Option<ApprovalResponse>, AgentError> {
        let start = Instant::now();
        let mut ctx = SecurityContext::new(task.task_id(), actor, tool_name, args, Vec::new());
        ctx.reason = format!("escalated after failure: {}", error);
        ctx.error = Some(error.to_string());

        let Some(hook) = self.approval.as_ref() else {
            self.finish(ctx, AuditOutcome::Escalated, None, Err(error.clone()), start);
            return Ok(None);
        };
        let request =
            ApprovalRequest::from_context(&ctx, PermissionLevel::RequireApproval, ctx.reason.clone()).as_escalation();
        let token = task.cancellation_token();
        let response = tokio::select! {
            r = hook.request_approval(&ctx, &request) => r,
            _ = token.cancelled() => {
                self.finish(ctx, AuditOutcome::Failed, None, Err(AgentError::Cancelled), start);
                return Err(AgentError::Cancelled);
            }
        };
        let response = response.unwrap_or_else(|e| ApprovalResponse::rejected(format!("approval hook error: {}", e)));
        let record = ApprovalRecord::new(&request, &response);
        self.finish(ctx, AuditOutcome::Escalated, Some(record), Err(error.clone()), start);
        Ok(Some(response))
    }

    /// 同任务同工具最近一分钟内实际执行过的次数
    fn recent_executions(&self, task_id: &str, tool_name: &str) -> usize {
        let since = chrono::Utc::now().timestamp_millis() - RATE_WINDOW_MS;
        self.audit
            .query(&AuditFilter::task(task_id).tool(tool_name).since(since))
            .iter()
            .filter(|e| matches!(e.outcome, AuditOutcome::Success | AuditOutcome::Failed))
            .filter(|e| e.context.started_at.is_some())
            .count()
    }

    /// 写审计并构造结果
    fn finish(
        &self,
        mut ctx: SecurityContext,
        outcome: AuditOutcome,
        approval: Option<ApprovalRecord>,
        result: Result<String, AgentError>,
        start: Instant,
    ) -> SandboxResult {
        let duration_ms = start.elapsed().as_millis() as u64;
        let (output, error) = match result {
            Ok(output) => (Some(output), None),
            Err(err) => (None, Some(err)),
        };
        ctx.result = output.clone();
        if let Some(err) = &error {
            ctx.error = Some(err.to_string());
        }
        if ctx.completed_at.is_none() {
            ctx.mark_completed();
        }

        let audit = serde_json::json!({
            "event": "tool_audit",
            "task_id": ctx.task_id,
            "execution_id": ctx.execution_id,
            "tool": ctx.tool_name,
            "level": ctx.effective_permission.map(|l| l.as_str()),
            "outcome": outcome.as_str(),
            "duration_ms": duration_ms,
            "args_preview": args_preview(&ctx.args),
        });
        match outcome {
            AuditOutcome::Success => tracing::info!(audit = %audit, "tool"),
            _ => tracing::warn!(audit = %audit, reason = %ctx.reason, "tool"),
        }

        let execution_id = ctx.execution_id.clone();
        let level = ctx.effective_permission;
        let reason = ctx.reason.clone();
        self.audit.log(AuditEntry::new(ctx, outcome, approval));

        SandboxResult {
            execution_id,
            allowed: false,
            requires_approval: level.is_some_and(|l| l.requires_approval()),
            approved: None,
            level,
            reason,
            outcome,
            result: output,
            error,
            duration_ms,
        }
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > ARGS_PREVIEW_CHARS {
        format!("{}...", s.chars().take(ARGS_PREVIEW_CHARS).collect::<String>())
    } else {
        s
    }
}
