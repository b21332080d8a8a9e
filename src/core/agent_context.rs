//! Agent 上下文：单次 Agent 激活的局部状态
//!
//! 持有任务上下文的引用、执行链中的 entry 下标、局部变量与连续错误计数。
//! 回合结束即丢弃，历史保存在执行链中。

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::core::task_context::TaskContext;
use crate::core::AgentError;

/// 连续错误上限的参考值
pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 10;

pub struct AgentContext {
    agent_name: String,
    task: Arc<TaskContext>,
    chain_entry: usize,
    local_variables: HashMap<String, Value>,
    consecutive_errors: u32,
    max_consecutive_errors: u32,
}

impl AgentContext {
    /// 在任务执行链中开启一个新 entry 并创建上下文
    pub fn begin(task: Arc<TaskContext>, agent_name: impl Into<String>) -> Self {
        let agent_name = agent_name.into();
        let chain_entry = task.chain().begin_entry(&agent_name);
        Self {
            agent_name,
            task,
            chain_entry,
            local_variables: HashMap::new(),
            consecutive_errors: 0,
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
        }
    }

    pub fn with_max_consecutive_errors(mut self, limit: u32) -> Self {
        self.max_consecutive_errors = limit.max(1);
        self
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn task(&self) -> &Arc<TaskContext> {
        &self.task
    }

    pub fn chain_entry(&self) -> usize {
        self.chain_entry
    }

    pub fn get_local(&self, key: &str) -> Option<&Value> {
        self.local_variables.get(key)
    }

    pub fn set_local(&mut self, key: impl Into<String>, value: Value) {
        self.local_variables.insert(key.into(), value);
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn max_consecutive_errors(&self) -> u32 {
        self.max_consecutive_errors
    }

    /// 工具成功：清零
    pub fn record_success(&mut self) {
        self.consecutive_errors = 0;
    }

    /// 工具失败或被拦截：计数 +1，达到上限返回 CapacityExceeded
    pub fn record_failure(&mut self) -> Result<(), AgentError> {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        if self.consecutive_errors >= self.max_consecutive_errors {
            tracing::warn!(
                task_id = %self.task.task_id(),
                agent = %self.agent_name,
                consecutive_errors = self.consecutive_errors,
                "Consecutive error limit reached"
            );
            return Err(AgentError::CapacityExceeded {
                consecutive_errors: self.consecutive_errors,
                limit: self.max_consecutive_errors,
            });
        }
        Ok(())
    }

    /// 结束回合，在执行链中标记完成
    pub fn finish(self) {
        self.task.chain().finish_entry(self.chain_entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_opens_chain_entry() {
        let task = Arc::new(TaskContext::new("t1"));
        let a = AgentContext::begin(task.clone(), "browser");
        let b = AgentContext::begin(task.clone(), "writer");
        assert_eq!(a.chain_entry(), 0);
        assert_eq!(b.chain_entry(), 1);
        a.finish();
        assert!(task.chain().entry(0).unwrap().is_finished());
        assert!(!task.chain().entry(1).unwrap().is_finished());
    }

    #[test]
    fn test_success_resets_counter() {
        let task = Arc::new(TaskContext::new("t1"));
        let mut agent = AgentContext::begin(task, "a").with_max_consecutive_errors(3);
        agent.record_failure().unwrap();
        agent.record_failure().unwrap();
        agent.record_success();
        assert_eq!(agent.consecutive_errors(), 0);
        agent.record_failure().unwrap();
        agent.record_failure().unwrap();
        let err = agent.record_failure().unwrap_err();
        assert_eq!(
            err,
            AgentError::CapacityExceeded {
                consecutive_errors: 3,
                limit: 3
            }
        );
    }

    #[test]
    fn test_local_variables_are_agent_scoped() {
        let task = Arc::new(TaskContext::new("t1"));
        let mut a = AgentContext::begin(task.clone(), "a");
        let b = AgentContext::begin(task, "b");
        a.set_local("cursor", serde_json::json!(5));
        assert_eq!(a.get_local("cursor"), Some(&serde_json::json!(5)));
        assert!(b.get_local("cursor").is_none());
    }
}
