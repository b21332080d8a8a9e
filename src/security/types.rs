//! 安全模型：权限级别、资源描述、规则与单次调用的安全上下文

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 权限级别，声明顺序即严格程度：Allow < Sandbox < RequireApproval < Deny
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    Allow,
    /// 需要审批，并以收紧的约束执行
    Sandbox,
    RequireApproval,
    Deny,
}

impl PermissionLevel {
    /// 取更严格者
    pub fn most_restrictive(self, other: PermissionLevel) -> PermissionLevel {
        self.max(other)
    }

    /// Sandbox 与 RequireApproval 都需要人工审批
    pub fn requires_approval(self) -> bool {
        matches!(self, PermissionLevel::Sandbox | PermissionLevel::RequireApproval)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PermissionLevel::Allow => "allow",
            PermissionLevel::Sandbox => "sandbox",
            PermissionLevel::RequireApproval => "require_approval",
            PermissionLevel::Deny => "deny",
        }
    }
}

impl std::fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 资源类型（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    FileSystem,
    Network,
    Command,
    Browser,
    Environment,
    Credential,
}

impl ResourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceType::FileSystem => "file_system",
            ResourceType::Network => "network",
            ResourceType::Command => "command",
            ResourceType::Browser => "browser",
            ResourceType::Environment => "environment",
            ResourceType::Credential => "credential",
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    Read,
    Write,
    Execute,
    Delete,
}

/// 工具调用声明要触及的资源
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub resource_type: ResourceType,
    pub identifier: String,
    pub access: AccessType,
}

impl ResourceRequest {
    pub fn new(resource_type: ResourceType, identifier: impl Into<String>, access: AccessType) -> Self {
        Self {
            resource_type,
            identifier: identifier.into(),
            access,
        }
    }

    pub fn file(path: impl Into<String>, access: AccessType) -> Self {
        Self::new(ResourceType::FileSystem, path, access)
    }

    pub fn url(url: impl Into<String>) -> Self {
        Self::new(ResourceType::Network, url, AccessType::Read)
    }

    pub fn command(cmd: impl Into<String>) -> Self {
        Self::new(ResourceType::Command, cmd, AccessType::Execute)
    }
}

/// 执行约束；合并时每个字段取最严格（最小）值
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionConstraints {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_calls_per_minute: Option<u32>,
    #[serde(default)]
    pub max_output_bytes: Option<usize>,
}

fn tighter<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

impl ExecutionConstraints {
    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn merge(&self, other: &ExecutionConstraints) -> ExecutionConstraints {
        ExecutionConstraints {
            timeout_ms: tighter(self.timeout_ms, other.timeout_ms),
            max_calls_per_minute: tighter(self.max_calls_per_minute, other.max_calls_per_minute),
            max_output_bytes: tighter(self.max_output_bytes, other.max_output_bytes),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.timeout_ms.is_none() && self.max_calls_per_minute.is_none() && self.max_output_bytes.is_none()
    }
}

/// 权限规则（数据而非代码，可运行时增删）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityPermission {
    #[serde(default = "new_permission_id")]
    pub id: String,
    /// 工具名：精确或通配（* / ?）
    pub tool_name: String,
    pub resource_type: ResourceType,
    /// 资源标识通配，None 表示该类型的任意资源
    #[serde(default)]
    pub resource_pattern: Option<String>,
    pub level: PermissionLevel,
    /// false 时等同 Deny
    #[serde(default = "default_grant")]
    pub grant: bool,
    /// 毫秒时间戳；过期规则不参与匹配
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub constraints: Option<ExecutionConstraints>,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_grant() -> bool {
    true
}

fn new_permission_id() -> String {
    format!("perm_{}", uuid::Uuid::new_v4())
}

impl SecurityPermission {
    pub fn new(tool_name: impl Into<String>, resource_type: ResourceType, level: PermissionLevel) -> Self {
        Self {
            id: new_permission_id(),
            tool_name: tool_name.into(),
            resource_type,
            resource_pattern: None,
            level,
            grant: true,
            expires_at: None,
            constraints: None,
            description: None,
        }
    }

    pub fn with_resource_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.resource_pattern = Some(pattern.into());
        self
    }

    pub fn denied(mut self) -> Self {
        self.grant = false;
        self
    }

    pub fn with_expiry(mut self, expires_at_ms: i64) -> Self {
        self.expires_at = Some(expires_at_ms);
        self
    }

    pub fn with_constraints(mut self, constraints: ExecutionConstraints) -> Self {
        self.constraints = Some(constraints);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|exp| now_ms >= exp)
    }

    /// grant=false 时强制为 Deny
    pub fn effective_level(&self) -> PermissionLevel {
        if self.grant {
            self.level
        } else {
            PermissionLevel::Deny
        }
    }
}

/// 决策状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionState {
    Pending,
    Allowed,
    Denied,
}

/// 单次工具调用尝试的安全上下文
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityContext {
    pub execution_id: String,
    pub task_id: String,
    pub actor: String,
    pub tool_name: String,
    pub args: Value,
    pub requested_resources: Vec<ResourceRequest>,
    pub effective_permission: Option<PermissionLevel>,
    pub decision: DecisionState,
    /// 人类可读的决策原因
    pub reason: String,
    pub applied_constraints: ExecutionConstraints,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl SecurityContext {
    pub fn new(
        task_id: impl Into<String>,
        actor: impl Into<String>,
        tool_name: impl Into<String>,
        args: Value,
        requested_resources: Vec<ResourceRequest>,
    ) -> Self {
        Self {
            execution_id: format!("exec_{}", uuid::Uuid::new_v4()),
            task_id: task_id.into(),
            actor: actor.into(),
            tool_name: tool_name.into(),
            args,
            requested_resources,
            effective_permission: None,
            decision: DecisionState::Pending,
            reason: String::new(),
            applied_constraints: ExecutionConstraints::default(),
            created_at: chrono::Utc::now().timestamp_millis(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    pub fn mark_started(&mut self) {
        self.started_at = Some(chrono::Utc::now().timestamp_millis());
    }

    pub fn mark_completed(&mut self) {
        self.completed_at = Some(chrono::Utc::now().timestamp_millis());
    }
}
