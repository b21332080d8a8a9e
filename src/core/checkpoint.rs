//! 任务检查点
//!
//! 序列化 {task_id, variables, conversation, 各 Agent 进度}，交给外部持久化钩子。
//! 钩子失败只记录日志，不影响任务控制流。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::chain::AgentProgress;
use crate::memory::Message;

/// 任务状态快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCheckpoint {
    pub id: String,
    pub task_id: String,
    pub variables: HashMap<String, Value>,
    pub conversation: Vec<Message>,
    pub agents: Vec<AgentProgress>,
    /// 毫秒时间戳
    pub created_at: i64,
}

impl TaskCheckpoint {
    pub fn new(
        task_id: impl Into<String>,
        variables: HashMap<String, Value>,
        conversation: Vec<Message>,
        agents: Vec<AgentProgress>,
    ) -> Self {
        Self {
            id: format!("ckpt_{}", uuid::Uuid::new_v4()),
            task_id: task_id.into(),
            variables,
            conversation,
            agents,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// 外部持久化钩子（尽力而为）
#[async_trait]
pub trait CheckpointSink: Send + Sync {
    async fn persist(&self, checkpoint: &TaskCheckpoint) -> anyhow::Result<()>;
}

/// 文件持久化：<dir>/<task_id>.json 保存最新检查点
#[derive(Debug, Clone)]
pub struct FileCheckpointSink {
    dir: PathBuf,
}

impl FileCheckpointSink {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", task_id))
    }

    /// 读取某任务最新检查点；文件不存在时返回 None
    pub async fn load(&self, task_id: &str) -> anyhow::Result<Option<TaskCheckpoint>> {
        let path = self.path_for(task_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&data)?))
    }
}

#[async_trait]
impl CheckpointSink for FileCheckpointSink {
    async fn persist(&self, checkpoint: &TaskCheckpoint) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&checkpoint.task_id);
        // 先写临时文件再 rename，避免读到半个文件
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(checkpoint)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_sink_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileCheckpointSink::new(dir.path().join("checkpoints"));
        let mut vars = HashMap::new();
        vars.insert("url".to_string(), serde_json::json!("https://example.com"));
        let ckpt = TaskCheckpoint::new("task_a", vars, vec![Message::user("go")], Vec::new());

        sink.persist(&ckpt).await.unwrap();
        let loaded = sink.load("task_a").await.unwrap().unwrap();
        assert_eq!(loaded, ckpt);
    }

    #[tokio::test]
    async fn test_file_sink_missing_task() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileCheckpointSink::new(dir.path());
        assert!(sink.load("nope").await.unwrap().is_none());
    }
}
