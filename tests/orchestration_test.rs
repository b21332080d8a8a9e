//! 编排引擎集成测试：沙箱场景、错误上限、暂停/取消与防抖

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use sentinel::core::{
        AgentError, FixedClassifier, PauseLevel, RecoveryAction, StateChangeHook, TaskContext, TaskSettings,
    };
    use sentinel::llm::ScriptedLlmClient;
    use sentinel::react::{run_agent, Planner, ReactSession};
    use sentinel::security::{
        evaluate, AccessType, ApprovalHook, ApprovalRequest, ApprovalResponse, AuditFilter, AuditLogger,
        AuditOutcome, InMemoryAuditLog, PermissionEvaluator, PermissionLevel, PermissionStore, ResourceRequest,
        ResourceType, SecurityConfig, SecurityContext, SecurityPermission, ToolSandbox,
    };
    use sentinel::tools::{EchoTool, ToolExecutor, ToolRegistry};

    struct ApproveAll;

    #[async_trait]
    impl ApprovalHook for ApproveAll {
        async fn request_approval(
            &self,
            _ctx: &SecurityContext,
            _request: &ApprovalRequest,
        ) -> anyhow::Result<ApprovalResponse> {
            Ok(ApprovalResponse::approved("tester"))
        }
    }

    fn permissive_config(high_risk: &[&str]) -> SecurityConfig {
        SecurityConfig {
            default_level: PermissionLevel::Allow,
            high_risk_patterns: high_risk.iter().map(|p| p.to_string()).collect(),
            ..SecurityConfig::default()
        }
    }

    fn delete_deny_rule() -> SecurityPermission {
        let mut rule = SecurityPermission::new("delete_*", ResourceType::FileSystem, PermissionLevel::Deny);
        rule.grant = false;
        rule
    }

    fn sandbox(
        config: SecurityConfig,
        rules: Vec<SecurityPermission>,
        approval: Option<Arc<dyn ApprovalHook>>,
    ) -> (ToolSandbox, Arc<InMemoryAuditLog>) {
        let store = Arc::new(PermissionStore::with_rules(rules).unwrap());
        let audit = Arc::new(InMemoryAuditLog::new());
        let mut sandbox = ToolSandbox::new(Arc::new(PermissionEvaluator::new(config, store)), audit.clone());
        if let Some(hook) = approval {
            sandbox = sandbox.with_approval_hook(hook);
        }
        (sandbox, audit)
    }

    /// 调用计数器 + 对应的 invoker
    fn spy() -> (
        Arc<AtomicUsize>,
        impl FnOnce() -> std::future::Ready<Result<String, String>> + Send,
    ) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let invoker = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok("done".to_string()))
        };
        (calls, invoker)
    }

    #[tokio::test]
    async fn test_resource_scoped_rule_ignores_name_only_match() {
        let (sandbox, audit) = sandbox(permissive_config(&[]), vec![delete_deny_rule()], None);
        let task = TaskContext::new("t1");
        let (calls, invoker) = spy();

        let result = sandbox
            .execute(&task, "agent", "delete_file", json!({}), Vec::new(), invoker)
            .await;

        assert_eq!(result.level, Some(PermissionLevel::Allow));
        assert!(result.allowed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(audit.query(&AuditFilter::task("t1").outcome(AuditOutcome::Success)).len(), 1);
    }

    #[tokio::test]
    async fn test_declared_resource_triggers_deny() {
        let (sandbox, audit) = sandbox(permissive_config(&[]), vec![delete_deny_rule()], None);
        let task = TaskContext::new("t1");
        let (calls, invoker) = spy();

        let result = sandbox
            .execute(
                &task,
                "agent",
                "delete_file",
                json!({"path": "/etc/passwd"}),
                vec![ResourceRequest::file("/etc/passwd", AccessType::Delete)],
                invoker,
            )
            .await;

        assert_eq!(result.level, Some(PermissionLevel::Deny));
        assert!(!result.allowed);
        assert!(matches!(result.error, Some(AgentError::PolicyDenied { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let entries = audit.query(&AuditFilter::task("t1"));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, AuditOutcome::Blocked);
    }

    #[tokio::test]
    async fn test_high_risk_tool_runs_after_approval() {
        let hook: Arc<dyn ApprovalHook> = Arc::new(ApproveAll);
        let (sandbox, audit) = sandbox(permissive_config(&["risky_*"]), Vec::new(), Some(hook));
        let task = TaskContext::new("t1");
        let (calls, invoker) = spy();

        let result = sandbox
            .execute(&task, "agent", "risky_tool", json!({}), Vec::new(), invoker)
            .await;

        assert!(result.requires_approval);
        assert_eq!(result.approved, Some(true));
        assert!(result.allowed);
        assert_eq!(result.result.as_deref(), Some("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let entries = audit.query(&AuditFilter::task("t1"));
        assert_eq!(entries.len(), 1);
        assert!(entries[0].approval.is_some());
    }

    #[tokio::test]
    async fn test_high_risk_tool_without_hook_is_blocked() {
        let (sandbox, audit) = sandbox(permissive_config(&["risky_*"]), Vec::new(), None);
        let task = TaskContext::new("t1");
        let (calls, invoker) = spy();

        let result = sandbox
            .execute(&task, "agent", "risky_tool", json!({}), Vec::new(), invoker)
            .await;

        assert!(!result.allowed);
        assert_eq!(result.error, Some(AgentError::ApprovalUnavailable));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let entries = audit.query(&AuditFilter::task("t1"));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, AuditOutcome::Blocked);
    }

    #[test]
    fn test_deny_dominates_any_rule_mix() {
        let levels = [
            PermissionLevel::Allow,
            PermissionLevel::Sandbox,
            PermissionLevel::RequireApproval,
            PermissionLevel::Deny,
        ];
        let config = permissive_config(&[]);
        let resource = ResourceRequest::file("/data/report.csv", AccessType::Read);

        for a in levels {
            for b in levels {
                let rules = vec![
                    SecurityPermission::new("read_*", ResourceType::FileSystem, a),
                    SecurityPermission::new("read_file", ResourceType::FileSystem, b)
                        .with_resource_pattern("/data/*"),
                ];
                let eval = evaluate(
                    &config,
                    &rules,
                    "agent",
                    "read_file",
                    &Value::Null,
                    std::slice::from_ref(&resource),
                    0,
                )
                .unwrap();
                assert_eq!(eval.level, a.most_restrictive(b), "rules {a:?} + {b:?}");
                assert_eq!(eval.matched_rules.len(), 2);
            }
        }
    }

    #[test]
    fn test_revoke_twice_leaves_rule_set_unchanged() {
        let store = PermissionStore::with_rules(vec![delete_deny_rule()]).unwrap();
        let id = store
            .add_permission(SecurityPermission::new("cat", ResourceType::FileSystem, PermissionLevel::Allow))
            .unwrap();
        assert_eq!(store.len(), 2);

        assert!(store.revoke_permission(&id));
        assert_eq!(store.len(), 1);
        assert!(!store.revoke_permission(&id));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_consecutive_failures_abort_even_when_classifier_continues() {
        let failing = r#"{"tool": "echo", "args": {"text": "x", "fail": true}}"#;
        let llm = Arc::new(ScriptedLlmClient::new(std::iter::repeat(failing).take(15)));
        let planner = Planner::new(llm, "test");

        let store = Arc::new(PermissionStore::new());
        let audit = Arc::new(InMemoryAuditLog::new());
        let evaluator = PermissionEvaluator::new(permissive_config(&[]), store);
        let sandbox = Arc::new(ToolSandbox::new(Arc::new(evaluator), audit.clone()));
        let executor = ToolExecutor::new(ToolRegistry::new().with_tool(EchoTool), sandbox);
        let classifier = FixedClassifier(RecoveryAction::Continue);
        let session = ReactSession::new(&planner, &executor, &classifier);

        let task = Arc::new(TaskContext::new("t1"));
        let err = run_agent(&session, &task, "worker", "keep failing").await.unwrap_err();

        assert_eq!(
            err.error,
            AgentError::CapacityExceeded {
                consecutive_errors: 10,
                limit: 10
            }
        );
        assert!(!err.error.is_policy_denial());
        assert!(task.is_cancelled());
        assert_eq!(audit.query(&AuditFilter::task("t1").outcome(AuditOutcome::Failed)).len(), 10);
    }

    #[tokio::test]
    async fn test_reset_gives_fresh_generation() {
        let task = TaskContext::new("t1");
        task.abort();
        assert_eq!(task.check_aborted(false).await, Err(AgentError::Cancelled));

        task.reset();
        assert_eq!(task.check_aborted(false).await, Ok(()));

        task.abort();
        assert_eq!(task.check_aborted(false).await, Err(AgentError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_pause_aborts_in_flight_operation_once() {
        let task = Arc::new(TaskContext::new("t1"));
        let aborts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&aborts);
        let _guard = task.register_abort_handle(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        task.set_pause(true, true);
        assert_eq!(task.pause_level(), PauseLevel::HardPause);
        assert_eq!(aborts.load(Ordering::SeqCst), 1);

        // 轮询中的 check_aborted 再次醒来、再次硬暂停都不会重复调用句柄
        let waiter = {
            let task = Arc::clone(&task);
            tokio::spawn(async move { task.check_aborted(false).await })
        };
        tokio::time::sleep(Duration::from_millis(1_200)).await;
        task.set_pause(true, true);
        task.set_pause(false, false);
        assert_eq!(waiter.await.unwrap(), Ok(()));
        assert_eq!(aborts.load(Ordering::SeqCst), 1);
        assert_eq!(task.active_operations(), 0);
    }

    #[derive(Default)]
    struct RecordingHook {
        calls: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl StateChangeHook for RecordingHook {
        async fn on_state_change(&self, _task_id: &str, key: &str, value: &Value) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push((key.to_string(), value.clone()));
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_variable_writes_notify_once() {
        let hook = Arc::new(RecordingHook::default());
        let task = TaskContext::new("t1")
            .with_settings(TaskSettings {
                state_debounce: Duration::from_millis(100),
                ..TaskSettings::default()
            })
            .with_state_hook(hook.clone());

        for i in 0..20 {
            task.set_variable("progress", json!(i)).await;
        }
        assert_eq!(task.get_variable("progress").await, Some(json!(19)));
        tokio::time::sleep(Duration::from_millis(150)).await;

        let calls = hook.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![("progress".to_string(), json!(19))]);
    }
}
