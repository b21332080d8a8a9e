//! Shell 工具
//!
//! 声明 command 资源（完整命令行），是否允许、是否需要审批由权限规则决定。
//! 工具本身只保留一层硬性兜底：拒绝明显破坏性的子串。
//! 子进程 kill_on_drop，沙箱超时或硬暂停丢弃 future 时进程随之结束。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::security::ResourceRequest;
use crate::tools::Tool;

/// 禁止的子串（不受规则影响）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf /",
    "rm -fr /",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:", // fork bomb
];

#[derive(Debug, Default)]
pub struct ShellTool {
    working_dir: Option<PathBuf>,
}

impl ShellTool {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在指定目录下执行（通常是工作区根目录）
    pub fn with_working_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    fn command_arg(args: &Value) -> &str {
        args.get("command").and_then(|v| v.as_str()).unwrap_or("").trim()
    }

    fn check_forbidden(raw: &str) -> Result<(), String> {
        let raw_lower = raw.to_lowercase();
        if raw_lower.is_empty() {
            return Err("Empty command".to_string());
        }
        match FORBIDDEN_SUBSTR.iter().find(|f| raw_lower.contains(*f)) {
            Some(forbidden) => Err(format!("Forbidden pattern: {}", forbidden)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run a shell command. Args: {\"command\": \"...\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                }
            },
            "required": ["command"]
        })
    }

    fn resources(&self, args: &Value) -> Vec<ResourceRequest> {
        vec![ResourceRequest::command(Self::command_arg(args))]
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let command = Self::command_arg(&args);
        Self::check_forbidden(command)?;

        tracing::info!(command = %command, "shell tool execute");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.kill_on_drop(true);

        let output = cmd.output().await.map_err(|e| format!("Execution failed: {}", e))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            return Err(format!("Exit {:?}\nstderr: {}", output.status, stderr.trim()));
        }
        Ok(if stderr.is_empty() {
            stdout
        } else {
            format!("{}\nstderr: {}", stdout.trim(), stderr.trim())
        })
    }
}
