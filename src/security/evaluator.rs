//! 权限评估器
//!
//! evaluate 是规则快照上的纯函数：不持有状态、没有副作用。
//! 合并规则：Deny > RequireApproval > Sandbox > Allow，永远取最严格者。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::AgentError;
use crate::security::pattern::GlobPattern;
use crate::security::store::PermissionStore;
use crate::security::types::{ExecutionConstraints, PermissionLevel, ResourceRequest, SecurityPermission};

/// 安全子系统配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// false 时所有调用直接 Allow
    pub enabled: bool,
    /// 未请求资源或资源无匹配规则时的级别
    pub default_level: PermissionLevel,
    /// 高风险工具名模式：级别为 Allow 时强制升级为 RequireApproval
    pub high_risk_patterns: Vec<String>,
    /// 每次调用的基础超时
    pub default_timeout_ms: u64,
    /// Sandbox 级别调用的超时上限
    pub sandbox_timeout_ms: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_level: PermissionLevel::RequireApproval,
            high_risk_patterns: vec!["delete_*".into(), "exec_*".into(), "shell*".into()],
            default_timeout_ms: 30_000,
            sandbox_timeout_ms: 10_000,
        }
    }
}

/// 评估结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionEvaluation {
    pub level: PermissionLevel,
    pub reason: String,
    /// 所有命中规则约束的并集
    pub constraints: ExecutionConstraints,
    pub matched_rules: Vec<String>,
}

/// 纯函数评估
pub fn evaluate(
    config: &SecurityConfig,
    rules: &[SecurityPermission],
    actor: &str,
    tool_name: &str,
    _args: &Value,
    resources: &[ResourceRequest],
    now_ms: i64,
) -> Result<PermissionEvaluation, AgentError> {
    if !config.enabled {
        return Ok(PermissionEvaluation {
            level: PermissionLevel::Allow,
            reason: "security disabled".to_string(),
            constraints: ExecutionConstraints::default(),
            matched_rules: Vec::new(),
        });
    }

    // 工具名命中且未过期的规则
    let mut tool_rules: Vec<&SecurityPermission> = Vec::new();
    for rule in rules.iter().filter(|r| !r.is_expired(now_ms)) {
        if GlobPattern::new(&rule.tool_name)?.matches(tool_name) {
            tool_rules.push(rule);
        }
    }

    let mut reasons: Vec<String> = Vec::new();
    let mut constraints = ExecutionConstraints::default();
    let mut matched_rules: Vec<String> = Vec::new();

    let mut level = if resources.is_empty() {
        reasons.push(format!("no resources requested, default level {}", config.default_level));
        config.default_level
    } else {
        let mut merged = PermissionLevel::Allow;
        for resource in resources {
            let mut resource_level: Option<PermissionLevel> = None;
            for rule in &tool_rules {
                if rule.resource_type != resource.resource_type {
                    continue;
                }
                if let Some(pattern) = &rule.resource_pattern {
                    if !GlobPattern::new(pattern)?.matches(&resource.identifier) {
                        continue;
                    }
                }
                let rule_level = rule.effective_level();
                resource_level = Some(resource_level.map_or(rule_level, |l| l.most_restrictive(rule_level)));
                if let Some(c) = &rule.constraints {
                    constraints = constraints.merge(c);
                }
                if !matched_rules.contains(&rule.id) {
                    matched_rules.push(rule.id.clone());
                }
            }
            let resource_level = match resource_level {
                Some(l) => {
                    reasons.push(format!(
                        "{}:{} matched rules -> {}",
                        resource.resource_type, resource.identifier, l
                    ));
                    l
                }
                None => {
                    reasons.push(format!(
                        "{}:{} no matching rule, default level {}",
                        resource.resource_type, resource.identifier, config.default_level
                    ));
                    config.default_level
                }
            };
            merged = merged.most_restrictive(resource_level);
        }
        merged
    };

    if level == PermissionLevel::Allow {
        for pattern in &config.high_risk_patterns {
            if GlobPattern::new(pattern)?.matches(tool_name) {
                level = PermissionLevel::RequireApproval;
                reasons.push(format!("high-risk pattern '{}' requires approval", pattern));
                break;
            }
        }
    }

    Ok(PermissionEvaluation {
        level,
        reason: format!("{} ({}): {}", tool_name, actor, reasons.join("; ")),
        constraints,
        matched_rules,
    })
}

/// 评估接口：沙箱通过它获取权限决策
pub trait PermissionPolicy: Send + Sync {
    fn evaluate(
        &self,
        actor: &str,
        tool_name: &str,
        args: &Value,
        resources: &[ResourceRequest],
    ) -> Result<PermissionEvaluation, AgentError>;

    fn config(&self) -> &SecurityConfig;
}

/// 基于 PermissionStore 的评估器：每次调用取一份规则快照
pub struct PermissionEvaluator {
    config: SecurityConfig,
    store: Arc<PermissionStore>,
}

impl PermissionEvaluator {
    pub fn new(config: SecurityConfig, store: Arc<PermissionStore>) -> Self {
        Self { config, store }
    }

    pub fn store(&self) -> &Arc<PermissionStore> {
        &self.store
    }
}

impl PermissionPolicy for PermissionEvaluator {
    fn evaluate(
        &self,
        actor: &str,
        tool_name: &str,
        args: &Value,
        resources: &[ResourceRequest],
    ) -> Result<PermissionEvaluation, AgentError> {
        let rules = self.store.snapshot();
        evaluate(
            &self.config,
            &rules,
            actor,
            tool_name,
            args,
            resources,
            chrono::Utc::now().timestamp_millis(),
        )
    }

    fn config(&self) -> &SecurityConfig {
        &self.config
    }
}
