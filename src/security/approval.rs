//! 人工审批
//!
//! ApprovalHook 是沙箱消费的审批通道；没有配置通道时一律拒绝。
//! ApprovalManager 是一个现成的通道实现：请求挂起在 pending 表中，
//! 由外部（UI、IM 机器人）调用 approve / reject 决定，超时视为拒绝。
//! 等待方被丢弃时请求随之撤下，之后的 approve / reject 返回 false。

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::security::types::{PermissionLevel, ResourceRequest, SecurityContext};

/// 发给审批人的结构化请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub task_id: String,
    pub execution_id: String,
    pub tool_name: String,
    pub args: Value,
    pub resources: Vec<ResourceRequest>,
    pub level: PermissionLevel,
    pub reason: String,
    /// 是否为执行失败后的升级（而非执行前审批）
    #[serde(default)]
    pub escalation: bool,
    pub created_at: i64,
}

impl ApprovalRequest {
    pub fn from_context(ctx: &SecurityContext, level: PermissionLevel, reason: impl Into<String>) -> Self {
        Self {
            id: format!("approval_{}", uuid::Uuid::new_v4()),
            task_id: ctx.task_id.clone(),
            execution_id: ctx.execution_id.clone(),
            tool_name: ctx.tool_name.clone(),
            args: ctx.args.clone(),
            resources: ctx.requested_resources.clone(),
            level,
            reason: reason.into(),
            escalation: false,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn as_escalation(mut self) -> Self {
        self.escalation = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub approved: bool,
    #[serde(default)]
    pub approver: Option<String>,
    #[serde(default)]
    pub feedback: Option<String>,
}

impl ApprovalResponse {
    pub fn approved(approver: impl Into<String>) -> Self {
        Self {
            approved: true,
            approver: Some(approver.into()),
            feedback: None,
        }
    }

    pub fn rejected(feedback: impl Into<String>) -> Self {
        Self {
            approved: false,
            approver: None,
            feedback: Some(feedback.into()),
        }
    }
}

/// 写入审计日志的审批记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub request_id: String,
    pub approved: bool,
    pub approver: Option<String>,
    pub feedback: Option<String>,
    pub requested_at: i64,
    pub resolved_at: i64,
}

impl ApprovalRecord {
    pub fn new(request: &ApprovalRequest, response: &ApprovalResponse) -> Self {
        Self {
            request_id: request.id.clone(),
            approved: response.approved,
            approver: response.approver.clone(),
            feedback: response.feedback.clone(),
            requested_at: request.created_at,
            resolved_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// 审批通道
#[async_trait]
pub trait ApprovalHook: Send + Sync {
    async fn request_approval(
        &self,
        ctx: &SecurityContext,
        request: &ApprovalRequest,
    ) -> anyhow::Result<ApprovalResponse>;
}

struct PendingApproval {
    request: ApprovalRequest,
    responder: oneshot::Sender<ApprovalResponse>,
}

type PendingMap = Mutex<HashMap<String, PendingApproval>>;

/// 等待方被丢弃（超时、任务取消）时撤下对应的挂起请求
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let removed = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(self.id);
        if removed.is_some() {
            tracing::debug!(approval_id = %self.id, "Pending approval withdrawn");
        }
    }
}

/// 挂起式审批管理器
pub struct ApprovalManager {
    pending: PendingMap,
    timeout: Duration,
}

impl ApprovalManager {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(300))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// 当前等待处理的请求
    pub async fn pending(&self) -> Vec<ApprovalRequest> {
        let mut requests: Vec<ApprovalRequest> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|p| p.request.clone())
            .collect();
        requests.sort_by_key(|r| r.created_at);
        requests
    }

    /// 批准；请求不存在或请求方已放弃时返回 false
    pub async fn approve(&self, id: &str, approver: impl Into<String>) -> bool {
        self.resolve(id, ApprovalResponse::approved(approver))
    }

    pub async fn reject(&self, id: &str, feedback: impl Into<String>) -> bool {
        self.resolve(id, ApprovalResponse::rejected(feedback))
    }

    fn resolve(&self, id: &str, response: ApprovalResponse) -> bool {
        let removed = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        let Some(pending) = removed else {
            return false;
        };
        let approved = response.approved;
        if pending.responder.send(response).is_err() {
            tracing::warn!(approval_id = %id, "Approval resolved after requester gave up");
            return false;
        }
        tracing::info!(approval_id = %id, approved, "Approval resolved");
        true
    }
}

impl Default for ApprovalManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApprovalHook for ApprovalManager {
    async fn request_approval(
        &self,
        _ctx: &SecurityContext,
        request: &ApprovalRequest,
    ) -> anyhow::Result<ApprovalResponse> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).insert(
            request.id.clone(),
            PendingApproval {
                request: request.clone(),
                responder: tx,
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            id: &request.id,
        };
        tracing::info!(approval_id = %request.id, tool = %request.tool_name, "Approval requested");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Ok(ApprovalResponse::rejected("approval channel closed")),
            Err(_) => {
                tracing::warn!(approval_id = %request.id, "Approval timed out");
                Ok(ApprovalResponse::rejected("approval timed out"))
            }
        }
    }
}
