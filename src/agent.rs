//! Headless 引擎运行时
//!
//! create_engine_components 按配置组装：规则库 → 评估器 → 审计日志 → 沙箱（可选审批通道）→ 工具执行器；
//! new_task 按配置创建 TaskContext（检查点落盘、周期检查点）；
//! process_task 在任务内跑一个 Agent 回合并返回结果。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::core::{CheckpointSink, ErrorClassifier, FileCheckpointSink, RecoveryEngine, StateChangeHook, TaskContext};
use crate::llm::LlmClient;
use crate::react::{run_agent, AgentRunError, AgentRunResult, Planner, ReactEvent, ReactSession};
use crate::security::{
    ApprovalHook, AuditLogger, InMemoryAuditLog, JsonlAuditLog, PermissionEvaluator, PermissionStore, ToolSandbox,
};
use crate::tools::{CatTool, EchoTool, LsTool, ShellTool, ToolExecutor, ToolRegistry, WriteFileTool};

/// 预构建的引擎组件，可被多个任务共享
pub struct EngineComponents {
    pub config: AppConfig,
    pub store: Arc<PermissionStore>,
    pub audit: Arc<dyn AuditLogger>,
    pub executor: ToolExecutor,
    pub classifier: Arc<dyn ErrorClassifier>,
    checkpoint_sink: Option<Arc<FileCheckpointSink>>,
    state_hook: Option<Arc<dyn StateChangeHook>>,
}

/// 默认工具集：cat / ls / write_file / echo / shell
pub fn default_registry(workspace: &Path) -> ToolRegistry {
    ToolRegistry::new()
        .with_tool(CatTool::new(workspace))
        .with_tool(LsTool::new(workspace))
        .with_tool(WriteFileTool::new(workspace))
        .with_tool(EchoTool)
        .with_tool(ShellTool::new().with_working_dir(workspace))
}

/// 工作目录：配置优先，否则 ./workspace
pub fn workspace_root(cfg: &AppConfig) -> PathBuf {
    cfg.agent
        .workspace_root
        .clone()
        .unwrap_or_else(|| PathBuf::from("workspace"))
}

pub fn create_engine_components(
    cfg: AppConfig,
    registry: ToolRegistry,
    approval: Option<Arc<dyn ApprovalHook>>,
) -> anyhow::Result<EngineComponents> {
    let store = Arc::new(PermissionStore::with_rules(cfg.rules.clone()).context("Invalid permission rule in config")?);

    let audit: Arc<dyn AuditLogger> = match (&cfg.audit.jsonl_path, cfg.audit.capacity) {
        (Some(path), _) => Arc::new(
            JsonlAuditLog::open(path).with_context(|| format!("Failed to open audit log {}", path.display()))?,
        ),
        (None, Some(cap)) => Arc::new(InMemoryAuditLog::with_capacity(cap)),
        (None, None) => Arc::new(InMemoryAuditLog::new()),
    };

    let evaluator = PermissionEvaluator::new(cfg.security_config(), Arc::clone(&store));
    let mut sandbox = ToolSandbox::new(Arc::new(evaluator), Arc::clone(&audit));
    if let Some(hook) = approval {
        sandbox = sandbox.with_approval_hook(hook);
    }
    let executor = ToolExecutor::new(registry, Arc::new(sandbox));

    let checkpoint_sink = cfg
        .task
        .checkpoint_dir
        .as_ref()
        .map(|dir| Arc::new(FileCheckpointSink::new(dir)));

    tracing::info!(
        rules = store.len(),
        tools = executor.tool_names().len(),
        security_enabled = cfg.security.enabled,
        "Engine components ready"
    );

    Ok(EngineComponents {
        config: cfg,
        store,
        audit,
        executor,
        classifier: Arc::new(RecoveryEngine::new()),
        checkpoint_sink,
        state_hook: None,
    })
}

impl EngineComponents {
    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_state_hook(mut self, hook: Arc<dyn StateChangeHook>) -> Self {
        self.state_hook = Some(hook);
        self
    }

    pub fn checkpoint_sink(&self) -> Option<&Arc<FileCheckpointSink>> {
        self.checkpoint_sink.as_ref()
    }

    /// 按配置创建任务上下文；配置了检查点间隔时立即开始周期检查点（需在 tokio 运行时内调用）
    pub fn new_task(&self, task_id: Option<String>) -> Arc<TaskContext> {
        let mut task = match task_id {
            Some(id) => TaskContext::new(id),
            None => TaskContext::generate(),
        }
        .with_settings(self.config.task_settings());
        if let Some(sink) = &self.checkpoint_sink {
            task = task.with_checkpoint_sink(Arc::clone(sink) as Arc<dyn CheckpointSink>);
        }
        if let Some(hook) = &self.state_hook {
            task = task.with_state_hook(Arc::clone(hook));
        }
        let task = Arc::new(task);
        if let Some(interval) = self.config.checkpoint_interval() {
            task.start_checkpointing(interval);
        }
        task
    }

    /// 从磁盘检查点恢复变量与对话；没有检查点时返回 false
    pub async fn resume_task(&self, task: &TaskContext) -> anyhow::Result<bool> {
        let Some(sink) = &self.checkpoint_sink else {
            return Ok(false);
        };
        match sink.load(task.task_id()).await? {
            Some(checkpoint) => {
                task.restore(&checkpoint).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// 在任务内跑一个 Agent 回合
pub async fn process_task(
    components: &EngineComponents,
    llm: Arc<dyn LlmClient>,
    system_prompt: &str,
    task: &Arc<TaskContext>,
    agent_name: &str,
    input: &str,
    event_tx: Option<&mpsc::UnboundedSender<ReactEvent>>,
) -> Result<AgentRunResult, AgentRunError> {
    let planner = Planner::new(llm, system_prompt);
    let mut session = ReactSession::new(&planner, &components.executor, components.classifier.as_ref())
        .with_config(components.config.loop_config());
    if let Some(tx) = event_tx {
        session = session.with_event_tx(tx);
    }
    run_agent(&session, task, agent_name, input).await
}

/// 拼 system prompt：基础说明 + 可用工具 schema
pub fn build_system_prompt(registry: &ToolRegistry) -> String {
    format!(
        "You are a careful agent. To use a tool reply with a single JSON object \
         {{\"tool\": \"name\", \"args\": {{...}}}} (or a JSON array of them). \
         Reply with plain text when the task is done.\n\nAvailable tools:\n{}",
        registry.to_schema_json()
    )
}
