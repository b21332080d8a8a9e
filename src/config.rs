//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SENTINEL__*` 覆盖（双下划线表示嵌套，如 `SENTINEL__SECURITY__ENABLED=false`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::TaskSettings;
use crate::react::LoopConfig;
use crate::security::{PermissionLevel, SecurityConfig, SecurityPermission};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub security: SecuritySection,
    pub task: TaskSection,
    pub agent: AgentSection,
    pub audit: AuditSection,
    /// 启动时载入的权限规则（[[rules]]）
    pub rules: Vec<SecurityPermission>,
}

/// [security] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    pub enabled: bool,
    pub default_level: PermissionLevel,
    pub high_risk_patterns: Vec<String>,
    pub default_timeout_ms: u64,
    pub sandbox_timeout_ms: u64,
}

impl Default for SecuritySection {
    fn default() -> Self {
        let defaults = SecurityConfig::default();
        Self {
            enabled: defaults.enabled,
            default_level: defaults.default_level,
            high_risk_patterns: defaults.high_risk_patterns,
            default_timeout_ms: defaults.default_timeout_ms,
            sandbox_timeout_ms: defaults.sandbox_timeout_ms,
        }
    }
}

/// [task] 段：暂停轮询、防抖窗口、检查点
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TaskSection {
    pub pause_poll_interval_ms: u64,
    pub state_debounce_ms: u64,
    /// 0 表示不启用周期检查点
    pub checkpoint_interval_ms: u64,
    pub checkpoint_dir: Option<PathBuf>,
    /// 对话日志上限（0 表示不限制）
    pub max_conversation_messages: usize,
}

impl Default for TaskSection {
    fn default() -> Self {
        Self {
            pause_poll_interval_ms: 500,
            state_debounce_ms: 100,
            checkpoint_interval_ms: 0,
            checkpoint_dir: None,
            max_conversation_messages: 0,
        }
    }
}

/// [agent] 段：循环上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_steps: usize,
    pub max_retries_per_call: u32,
    pub max_consecutive_errors: u32,
    /// 文件工具的根目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
}

impl Default for AgentSection {
    fn default() -> Self {
        let defaults = LoopConfig::default();
        Self {
            max_steps: defaults.max_steps,
            max_retries_per_call: defaults.max_retries_per_call,
            max_consecutive_errors: defaults.max_consecutive_errors,
            workspace_root: None,
        }
    }
}

/// [audit] 段
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuditSection {
    /// 内存环形容量，未设置时不限
    pub capacity: Option<usize>,
    /// 设置后追加写 JSON Lines
    pub jsonl_path: Option<PathBuf>,
}

impl AppConfig {
    pub fn security_config(&self) -> SecurityConfig {
        SecurityConfig {
            enabled: self.security.enabled,
            default_level: self.security.default_level,
            high_risk_patterns: self.security.high_risk_patterns.clone(),
            default_timeout_ms: self.security.default_timeout_ms,
            sandbox_timeout_ms: self.security.sandbox_timeout_ms,
        }
    }

    pub fn task_settings(&self) -> TaskSettings {
        TaskSettings {
            pause_poll_interval: Duration::from_millis(self.task.pause_poll_interval_ms.max(1)),
            state_debounce: Duration::from_millis(self.task.state_debounce_ms),
            max_conversation_messages: self.task.max_conversation_messages,
        }
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            max_steps: self.agent.max_steps,
            max_retries_per_call: self.agent.max_retries_per_call,
            max_consecutive_errors: self.agent.max_consecutive_errors,
        }
    }

    /// None 表示不启用周期检查点
    pub fn checkpoint_interval(&self) -> Option<Duration> {
        (self.task.checkpoint_interval_ms > 0).then(|| Duration::from_millis(self.task.checkpoint_interval_ms))
    }
}

/// 从 config 目录加载配置，环境变量 SENTINEL__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 SENTINEL__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("SENTINEL")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
