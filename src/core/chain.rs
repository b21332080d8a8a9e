//! 执行链：任务内 Agent 调用与工具调用的只追加记录
//!
//! 每次 Agent 激活对应一个 ChainEntry，其中按结果落定顺序追加 ToolCallRecord。
//! 用于重规划或恢复时回答「刚刚发生了什么」，而不必重放副作用。

use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 单次工具调用的结果状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Succeeded,
    Failed,
    Blocked,
    Skipped,
}

/// 工具调用记录（写入后不再修改）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub execution_id: String,
    pub tool_name: String,
    pub args: Value,
    pub status: ToolCallStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    /// 毫秒时间戳
    pub started_at: i64,
    pub finished_at: i64,
}

/// 一次 Agent 激活的记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainEntry {
    pub index: usize,
    pub agent_name: String,
    pub started_at: i64,
    /// Agent 回合结束时设置一次
    pub finished_at: Option<i64>,
    pub tool_calls: Vec<ToolCallRecord>,
}

impl ChainEntry {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// 检查点中的单个 Agent 进度
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProgress {
    pub agent_name: String,
    pub entry_index: usize,
    pub completed_tools: Vec<String>,
    pub finished: bool,
}

/// 只追加的执行链；append 在锁内完成，可被并行 Agent 共享
#[derive(Debug, Default)]
pub struct ExecutionChain {
    entries: Mutex<Vec<ChainEntry>>,
}

impl ExecutionChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// 开始一个 Agent 回合，返回 entry 下标
    pub fn begin_entry(&self, agent_name: &str) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let index = entries.len();
        entries.push(ChainEntry {
            index,
            agent_name: agent_name.to_string(),
            started_at: chrono::Utc::now().timestamp_millis(),
            finished_at: None,
            tool_calls: Vec::new(),
        });
        index
    }

    /// 追加工具调用记录；已结束或不存在的 entry 返回 false
    pub fn record_tool_call(&self, entry: usize, record: ToolCallRecord) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get_mut(entry) {
            Some(e) if !e.is_finished() => {
                e.tool_calls.push(record);
                true
            }
            _ => false,
        }
    }

    /// 结束 Agent 回合；重复调用不改变首次时间
    pub fn finish_entry(&self, entry: usize) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(e) = entries.get_mut(entry) {
            if e.finished_at.is_none() {
                e.finished_at = Some(chrono::Utc::now().timestamp_millis());
            }
        }
    }

    pub fn entries(&self) -> Vec<ChainEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn entry(&self, index: usize) -> Option<ChainEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 最近一次成功的工具调用
    pub fn last_tool_result(&self) -> Option<ToolCallRecord> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .rev()
            .flat_map(|e| e.tool_calls.iter().rev())
            .find(|c| c.status == ToolCallStatus::Succeeded)
            .cloned()
    }

    /// 已成功执行过的工具名（按执行顺序，去重）
    pub fn executed_tools(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = Vec::new();
        for call in entries.iter().flat_map(|e| e.tool_calls.iter()) {
            if call.status == ToolCallStatus::Succeeded && !names.contains(&call.tool_name) {
                names.push(call.tool_name.clone());
            }
        }
        names
    }

    /// 同名同参的工具是否已成功执行过（恢复时避免重复副作用）
    pub fn has_succeeded(&self, tool_name: &str, args: &Value) -> bool {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.iter().flat_map(|e| e.tool_calls.iter()).any(|c| {
            c.status == ToolCallStatus::Succeeded && c.tool_name == tool_name && &c.args == args
        })
    }

    /// 最近一个已结束的 entry（任务取消时报告部分进度）
    pub fn last_completed_entry(&self) -> Option<ChainEntry> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.iter().rev().find(|e| e.is_finished()).cloned()
    }

    pub fn progress(&self) -> Vec<AgentProgress> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .map(|e| AgentProgress {
                agent_name: e.agent_name.clone(),
                entry_index: e.index,
                completed_tools: e
                    .tool_calls
                    .iter()
                    .filter(|c| c.status == ToolCallStatus::Succeeded)
                    .map(|c| c.tool_name.clone())
                    .collect(),
                finished: e.is_finished(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tool: &str, status: ToolCallStatus) -> ToolCallRecord {
        ToolCallRecord {
            execution_id: format!("exec_{}", tool),
            tool_name: tool.to_string(),
            args: serde_json::json!({}),
            status,
            result: Some(format!("{} ok", tool)),
            error: None,
            started_at: 0,
            finished_at: 1,
        }
    }

    #[test]
    fn test_last_tool_result_skips_failures() {
        let chain = ExecutionChain::new();
        let e = chain.begin_entry("browser");
        chain.record_tool_call(e, record("navigate", ToolCallStatus::Succeeded));
        chain.record_tool_call(e, record("click", ToolCallStatus::Failed));

        let last = chain.last_tool_result().unwrap();
        assert_eq!(last.tool_name, "navigate");
        assert_eq!(chain.executed_tools(), vec!["navigate".to_string()]);
    }

    #[test]
    fn test_finished_entry_rejects_appends() {
        let chain = ExecutionChain::new();
        let e = chain.begin_entry("writer");
        chain.finish_entry(e);
        assert!(!chain.record_tool_call(e, record("write", ToolCallStatus::Succeeded)));
        assert!(chain.entry(e).unwrap().tool_calls.is_empty());
    }

    #[test]
    fn test_last_completed_entry_and_progress() {
        let chain = ExecutionChain::new();
        let first = chain.begin_entry("planner");
        chain.record_tool_call(first, record("search", ToolCallStatus::Succeeded));
        chain.finish_entry(first);
        let _second = chain.begin_entry("browser");

        assert_eq!(chain.last_completed_entry().unwrap().agent_name, "planner");
        let progress = chain.progress();
        assert_eq!(progress.len(), 2);
        assert!(progress[0].finished);
        assert_eq!(progress[0].completed_tools, vec!["search".to_string()]);
        assert!(!progress[1].finished);
    }

    #[test]
    fn test_has_succeeded_matches_args() {
        let chain = ExecutionChain::new();
        let e = chain.begin_entry("a");
        let mut r = record("write", ToolCallStatus::Succeeded);
        r.args = serde_json::json!({"path": "/tmp/x"});
        chain.record_tool_call(e, r);
        assert!(chain.has_succeeded("write", &serde_json::json!({"path": "/tmp/x"})));
        assert!(!chain.has_succeeded("write", &serde_json::json!({"path": "/tmp/y"})));
    }
}
