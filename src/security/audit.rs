//! 审计日志
//!
//! 只追加：log 不修改任何已写入条目；query 按插入顺序返回过滤结果。
//! InMemoryAuditLog 可选容量上限（环形）；JsonlAuditLog 额外把每条记录追加到 JSON Lines 文件。

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::security::approval::ApprovalRecord;
use crate::security::types::SecurityContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Blocked,
    Failed,
    Escalated,
}

impl AuditOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Blocked => "blocked",
            AuditOutcome::Failed => "failed",
            AuditOutcome::Escalated => "escalated",
        }
    }
}

/// 审计条目（写入后不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub task_id: String,
    pub context: SecurityContext,
    pub outcome: AuditOutcome,
    #[serde(default)]
    pub approval: Option<ApprovalRecord>,
    pub logged_at: i64,
}

impl AuditEntry {
    pub fn new(context: SecurityContext, outcome: AuditOutcome, approval: Option<ApprovalRecord>) -> Self {
        Self {
            id: format!("audit_{}", uuid::Uuid::new_v4()),
            task_id: context.task_id.clone(),
            context,
            outcome,
            approval,
            logged_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// 查询条件；None 表示不过滤
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub task_id: Option<String>,
    pub tool_name: Option<String>,
    pub outcome: Option<AuditOutcome>,
    /// logged_at >= since
    pub since: Option<i64>,
    /// logged_at <= until
    pub until: Option<i64>,
}

impl AuditFilter {
    pub fn task(task_id: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id.into()),
            ..Default::default()
        }
    }

    pub fn tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    pub fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn since(mut self, ms: i64) -> Self {
        self.since = Some(ms);
        self
    }

    pub fn until(mut self, ms: i64) -> Self {
        self.until = Some(ms);
        self
    }

    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.task_id.as_ref().map_or(true, |t| &entry.task_id == t)
            && self
                .tool_name
                .as_ref()
                .map_or(true, |t| &entry.context.tool_name == t)
            && self.outcome.map_or(true, |o| entry.outcome == o)
            && self.since.map_or(true, |s| entry.logged_at >= s)
            && self.until.map_or(true, |u| entry.logged_at <= u)
    }
}

/// 审计日志接口
pub trait AuditLogger: Send + Sync {
    fn log(&self, entry: AuditEntry);

    fn query(&self, filter: &AuditFilter) -> Vec<AuditEntry>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 内存审计日志
#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    entries: RwLock<VecDeque<AuditEntry>>,
    capacity: Option<usize>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 环形容量：超出后丢弃最旧条目
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity: Some(capacity.max(1)),
        }
    }
}

impl AuditLogger for InMemoryAuditLog {
    fn log(&self, entry: AuditEntry) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(cap) = self.capacity {
            while entries.len() >= cap {
                entries.pop_front();
            }
        }
        entries.push_back(entry);
    }

    fn query(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// JSON Lines 审计日志：文件追加 + 内存索引
pub struct JsonlAuditLog {
    path: PathBuf,
    file: Mutex<File>,
    index: InMemoryAuditLog,
}

impl JsonlAuditLog {
    /// 打开（或创建）日志文件，并加载已有条目到索引
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let index = InMemoryAuditLog::new();
        if path.exists() {
            let data = std::fs::read_to_string(&path)?;
            for line in data.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<AuditEntry>(line) {
                    Ok(entry) => index.log(entry),
                    Err(e) => tracing::warn!(path = %path.display(), "Skipping malformed audit line: {}", e),
                }
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            index,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditLogger for JsonlAuditLog {
    fn log(&self, entry: AuditEntry) {
        match serde_json::to_string(&entry) {
            Ok(line) => {
                let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
                if let Err(e) = writeln!(file, "{}", line) {
                    tracing::error!(path = %self.path.display(), "Failed to append audit entry: {}", e);
                }
            }
            Err(e) => tracing::error!("Failed to serialize audit entry: {}", e),
        }
        self.index.log(entry);
    }

    fn query(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        self.index.query(filter)
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}
