//! 权限规则存储
//!
//! 写时复制：每次增删替换整个 Arc<Vec<_>>，evaluate 始终拿到一份一致的不可变快照。

use std::sync::{Arc, PoisonError, RwLock};

use crate::core::AgentError;
use crate::security::pattern::GlobPattern;
use crate::security::types::SecurityPermission;

#[derive(Debug, Default)]
pub struct PermissionStore {
    rules: RwLock<Arc<Vec<SecurityPermission>>>,
}

impl PermissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 用初始规则集创建；非法模式直接报错
    pub fn with_rules(rules: Vec<SecurityPermission>) -> Result<Self, AgentError> {
        for rule in &rules {
            validate(rule)?;
        }
        Ok(Self {
            rules: RwLock::new(Arc::new(rules)),
        })
    }

    /// 当前规则快照
    pub fn snapshot(&self) -> Arc<Vec<SecurityPermission>> {
        Arc::clone(&self.rules.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// 添加规则，同 id 的旧规则被替换；返回规则 id
    pub fn add_permission(&self, rule: SecurityPermission) -> Result<String, AgentError> {
        validate(&rule)?;
        let id = rule.id.clone();
        let mut guard = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let mut next: Vec<SecurityPermission> = guard.iter().filter(|r| r.id != id).cloned().collect();
        next.push(rule);
        *guard = Arc::new(next);
        tracing::info!(rule_id = %id, "Permission rule added");
        Ok(id)
    }

    /// 撤销规则；不存在时为 no-op 并返回 false
    pub fn revoke_permission(&self, id: &str) -> bool {
        let mut guard = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        if !guard.iter().any(|r| r.id == id) {
            return false;
        }
        let next: Vec<SecurityPermission> = guard.iter().filter(|r| r.id != id).cloned().collect();
        *guard = Arc::new(next);
        tracing::info!(rule_id = %id, "Permission rule revoked");
        true
    }

    /// 清理已过期规则，返回清理数量
    pub fn purge_expired(&self, now_ms: i64) -> usize {
        let mut guard = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let before = guard.len();
        let next: Vec<SecurityPermission> = guard.iter().filter(|r| !r.is_expired(now_ms)).cloned().collect();
        let removed = before - next.len();
        if removed > 0 {
            *guard = Arc::new(next);
            tracing::debug!(removed, "Expired permission rules purged");
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<SecurityPermission> {
        self.snapshot().iter().find(|r| r.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn validate(rule: &SecurityPermission) -> Result<(), AgentError> {
    GlobPattern::new(&rule.tool_name)?;
    if let Some(pattern) = &rule.resource_pattern {
        GlobPattern::new(pattern)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::types::{PermissionLevel, ResourceType};

    fn rule(id: &str) -> SecurityPermission {
        let mut r = SecurityPermission::new("read_*", ResourceType::FileSystem, PermissionLevel::Allow);
        r.id = id.to_string();
        r
    }

    #[test]
    fn test_revoke_twice_is_noop() {
        let store = PermissionStore::new();
        store.add_permission(rule("a")).unwrap();
        store.add_permission(rule("b")).unwrap();
        assert!(store.revoke_permission("a"));
        assert_eq!(store.len(), 1);
        assert!(!store.revoke_permission("a"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_add_same_id_replaces() {
        let store = PermissionStore::new();
        store.add_permission(rule("a")).unwrap();
        let mut updated = rule("a");
        updated.level = PermissionLevel::Deny;
        store.add_permission(updated).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a").unwrap().level, PermissionLevel::Deny);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_writes() {
        let store = PermissionStore::new();
        store.add_permission(rule("a")).unwrap();
        let snap = store.snapshot();
        store.add_permission(rule("b")).unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_purge_expired() {
        let store = PermissionStore::new();
        store.add_permission(rule("old").with_expiry(1_000)).unwrap();
        store.add_permission(rule("fresh").with_expiry(10_000)).unwrap();
        store.add_permission(rule("forever")).unwrap();
        assert_eq!(store.purge_expired(5_000), 1);
        assert!(store.get("old").is_none());
        assert_eq!(store.len(), 2);
    }
}
