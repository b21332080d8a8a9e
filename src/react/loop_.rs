//! Agent 主循环
//!
//! Plan -> Act (经沙箱执行 Tool) -> Observe -> 下一轮 Plan。
//! 每轮开头、模型调用之后、每次工具调用前后都调用 check_aborted，暂停在这些点生效，取消在这些点上抛。
//!
//! 失败处理：
//! - Cancelled 直接上抛，不重试
//! - 策略拒绝（含无审批通道）不重试，原因作为 Observation 交给模型
//! - 执行失败交给 ErrorClassifier；Retry 受单次调用上限约束，用尽后按 Continue 处理
//! - 连续失败/拦截达到上限时中止整个任务（CapacityExceeded）

use std::sync::Arc;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::core::{
    AgentContext, AgentError, ChainEntry, ErrorClassifier, PauseLevel, RecoveryAction, TaskContext, ToolCallRecord,
    ToolCallStatus,
};
use crate::memory::Message;
use crate::react::planner::{parse_llm_output, Planner, PlannerOutput, ToolCall};
use crate::react::ReactEvent;
use crate::security::{AuditOutcome, SandboxResult};
use crate::tools::ToolExecutor;

/// Observation 预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;

/// 循环上限
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopConfig {
    /// 单个 Agent 回合内最大步数，防止死循环
    pub max_steps: usize,
    /// 单次工具调用最多尝试次数（含首次）
    pub max_retries_per_call: u32,
    pub max_consecutive_errors: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_steps: 20,
            max_retries_per_call: 3,
            max_consecutive_errors: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentRunResult {
    pub agent_name: String,
    pub response: String,
    pub steps: usize,
    pub chain_entry: usize,
    /// false 表示因步数上限结束
    pub completed: bool,
}

/// Agent 异常结束：带上最近一个已完成的执行链 entry，便于恢复部分进度
#[derive(Debug, Clone, thiserror::Error)]
#[error("agent '{agent_name}' stopped: {error}")]
pub struct AgentRunError {
    pub agent_name: String,
    #[source]
    pub error: AgentError,
    pub last_completed: Option<ChainEntry>,
}

/// 循环依赖的协作者
pub struct ReactSession<'a> {
    pub planner: &'a Planner,
    pub executor: &'a ToolExecutor,
    pub classifier: &'a dyn ErrorClassifier,
    pub config: LoopConfig,
    /// 可选：事件推送通道
    pub event_tx: Option<&'a UnboundedSender<ReactEvent>>,
}

impl<'a> ReactSession<'a> {
    pub fn new(planner: &'a Planner, executor: &'a ToolExecutor, classifier: &'a dyn ErrorClassifier) -> Self {
        Self {
            planner,
            executor,
            classifier,
            config: LoopConfig::default(),
            event_tx: None,
        }
    }

    pub fn with_config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_event_tx(mut self, tx: &'a UnboundedSender<ReactEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    fn send_event(&self, ev: ReactEvent) {
        if let Some(tx) = self.event_tx {
            let _ = tx.send(ev);
        }
    }
}

/// 在任务内运行一个 Agent 回合
pub async fn run_agent(
    session: &ReactSession<'_>,
    task: &Arc<TaskContext>,
    agent_name: &str,
    input: &str,
) -> Result<AgentRunResult, AgentRunError> {
    let mut agent = AgentContext::begin(Arc::clone(task), agent_name)
        .with_max_consecutive_errors(session.config.max_consecutive_errors);
    let outcome = drive(session, &mut agent, input).await;

    match outcome {
        Ok(result) => {
            agent.finish();
            tracing::info!(task_id = %task.task_id(), agent = %agent_name, steps = result.steps, "Agent finished");
            Ok(result)
        }
        Err(error) => {
            // 先取再结束本 entry：报告的是中断前已完成的部分
            let last_completed = task.chain().last_completed_entry();
            match &error {
                AgentError::Cancelled => {
                    tracing::info!(task_id = %task.task_id(), agent = %agent_name, "Agent cancelled");
                }
                AgentError::CapacityExceeded { .. } => {
                    tracing::error!(task_id = %task.task_id(), agent = %agent_name, error = %error, "Aborting task: tool reliability");
                    task.abort();
                }
                _ => {
                    tracing::warn!(task_id = %task.task_id(), agent = %agent_name, error = %error, "Agent failed");
                }
            }
            session.send_event(ReactEvent::Error {
                agent: agent_name.to_string(),
                text: error.to_string(),
            });
            agent.finish();
            Err(AgentRunError {
                agent_name: agent_name.to_string(),
                error,
                last_completed,
            })
        }
    }
}

/// 并行模式：多个 Agent 共享同一个 TaskContext，各自持有 AgentContext。
/// 执行链中的记录按结果落定顺序追加。
pub async fn run_agents_parallel(
    session: &ReactSession<'_>,
    task: &Arc<TaskContext>,
    agents: &[(String, String)],
) -> Vec<Result<AgentRunResult, AgentRunError>> {
    join_all(
        agents
            .iter()
            .map(|(name, input)| run_agent(session, task, name, input)),
    )
    .await
}

async fn drive(session: &ReactSession<'_>, agent: &mut AgentContext, input: &str) -> Result<AgentRunResult, AgentError> {
    let task = Arc::clone(agent.task());
    let name = agent.agent_name().to_string();
    let max_steps = session.config.max_steps;

    let mut messages = vec![Message::user(input)];
    task.push_message(Message::user(input)).await;
    let mut last_output = String::new();

    for step in 0..max_steps {
        task.check_aborted(false).await?;
        session.send_event(ReactEvent::StepUpdate {
            agent: name.clone(),
            step,
            max_steps,
        });
        session.send_event(ReactEvent::Thinking { agent: name.clone() });

        let output = session.planner.plan(&messages).await?;
        task.check_aborted(false).await?;
        last_output = output.clone();

        match parse_llm_output(&output) {
            Ok(PlannerOutput::Response(text)) => {
                task.push_message(Message::assistant(text.clone())).await;
                session.send_event(ReactEvent::MessageDone {
                    agent: name.clone(),
                    text: text.clone(),
                });
                return Ok(AgentRunResult {
                    agent_name: name,
                    response: text,
                    steps: step + 1,
                    chain_entry: agent.chain_entry(),
                    completed: true,
                });
            }
            Ok(PlannerOutput::ToolCalls(calls)) => {
                messages.push(Message::assistant(output));
                for call in calls {
                    let observation = execute_call(session, agent, &call).await?;
                    messages.push(Message::tool(&call.tool, &observation));
                    task.push_message(Message::tool(&call.tool, &observation)).await;
                }
            }
            Err(e) => {
                tracing::warn!(agent = %name, error = %e, "Unparseable model output");
                messages.push(Message::assistant(output));
                messages.push(Message::user(format!(
                    "{}. Reply with a single JSON tool call {{\"tool\": \"name\", \"args\": {{...}}}} or plain text.",
                    e
                )));
            }
        }
    }

    Ok(AgentRunResult {
        agent_name: name,
        response: format!("Reached max steps ({}); last output:\n{}", max_steps, last_output),
        steps: max_steps,
        chain_entry: agent.chain_entry(),
        completed: false,
    })
}

/// 执行单个 Tool Call，返回交给模型的 Observation
async fn execute_call(session: &ReactSession<'_>, agent: &mut AgentContext, call: &ToolCall) -> Result<String, AgentError> {
    let task = Arc::clone(agent.task());
    let name = agent.agent_name().to_string();
    let max_attempts = session.config.max_retries_per_call.max(1);
    let mut attempt: u32 = 0;

    loop {
        task.check_aborted(false).await?;
        attempt += 1;
        session.send_event(ReactEvent::ToolCall {
            agent: name.clone(),
            tool: call.tool.clone(),
            args: call.args.clone(),
            attempt,
        });

        let started_at = chrono::Utc::now().timestamp_millis();
        let result = match session
            .executor
            .execute(&task, &name, &call.tool, call.args.clone())
            .await
        {
            Ok(result) => result,
            Err(AgentError::HallucinatedTool(tool)) => {
                let observation = format!(
                    "Error: unknown tool '{}'. Available tools: {}",
                    tool,
                    session.executor.tool_names().join(", ")
                );
                record_call(agent, call, String::new(), ToolCallStatus::Failed, None, Some(observation.clone()), started_at);
                session.send_event(ReactEvent::ToolFailure {
                    agent: name.clone(),
                    tool: tool.clone(),
                    reason: "unknown tool".to_string(),
                });
                agent.record_failure()?;
                return Ok(observation);
            }
            Err(e) => return Err(e),
        };

        let Some(error) = result.error.clone() else {
            record_result(agent, call, &result, ToolCallStatus::Succeeded, started_at);
            agent.record_success();
            let output = result.result.unwrap_or_default();
            session.send_event(ReactEvent::Observation {
                agent: name.clone(),
                tool: call.tool.clone(),
                preview: preview(&output),
            });
            task.check_aborted(false).await?;
            return Ok(output);
        };

        if error == AgentError::Cancelled || !error.is_retryable() {
            let status = match result.outcome {
                AuditOutcome::Blocked => ToolCallStatus::Blocked,
                _ => ToolCallStatus::Failed,
            };
            record_result(agent, call, &result, status, started_at);
            if error == AgentError::Cancelled {
                return Err(error);
            }
            session.send_event(ReactEvent::ToolFailure {
                agent: name.clone(),
                tool: call.tool.clone(),
                reason: error.to_string(),
            });
            agent.record_failure()?;
            // 同样的输入会得到同样的拒绝
            return Ok(format!("Blocked: {}", error));
        }

        session.send_event(ReactEvent::ToolFailure {
            agent: name.clone(),
            tool: call.tool.clone(),
            reason: error.to_string(),
        });
        // 执行失败的记录等分类结果出来再写：Skip 记为 Skipped
        if let Err(e) = agent.record_failure() {
            record_result(agent, call, &result, ToolCallStatus::Failed, started_at);
            return Err(e);
        }
        if let Err(e) = task.check_aborted(false).await {
            record_result(agent, call, &result, ToolCallStatus::Failed, started_at);
            return Err(e);
        }
        let action = session
            .classifier
            .classify(agent, &call.tool, &error, &call.args)
            .await;
        let status = if action == RecoveryAction::Skip {
            ToolCallStatus::Skipped
        } else {
            ToolCallStatus::Failed
        };
        record_result(agent, call, &result, status, started_at);
        session.send_event(ReactEvent::Recovery {
            agent: name.clone(),
            action: format!("{:?}", action),
            detail: error.to_string(),
        });

        match action {
            RecoveryAction::Retry if attempt < max_attempts => continue,
            RecoveryAction::Retry => {
                tracing::warn!(agent = %name, tool = %call.tool, attempts = attempt, "Retry limit reached");
                return Ok(format!("Error: {} (gave up after {} attempts)", error, attempt));
            }
            RecoveryAction::Skip => return Ok(String::new()),
            RecoveryAction::Continue => return Ok(format!("Error: {}", error)),
            RecoveryAction::Escalate => {
                let approved = escalate(session, agent, call, &error).await?;
                if !approved {
                    return Ok(format!("Error: {} (escalation rejected)", error));
                }
                if attempt >= max_attempts {
                    return Ok(format!("Error: {} (gave up after {} attempts)", error, attempt));
                }
            }
        }
    }
}

/// 挂起任务并交给人工；返回是否允许重试。
/// 没有审批通道时保持挂起，直到外部恢复（视为允许重试）或中止。
async fn escalate(
    session: &ReactSession<'_>,
    agent: &AgentContext,
    call: &ToolCall,
    error: &AgentError,
) -> Result<bool, AgentError> {
    let task = agent.task();
    task.set_pause(true, false);
    session.send_event(ReactEvent::Parked {
        agent: agent.agent_name().to_string(),
        tool: call.tool.clone(),
    });
    tracing::warn!(task_id = %task.task_id(), tool = %call.tool, error = %error, "Task parked pending escalation");

    match session
        .executor
        .escalate(task, agent.agent_name(), &call.tool, call.args.clone(), error)
        .await?
    {
        Some(response) => {
            // 只撤销自己设置的挂起；等待期间操作员改过的暂停保留
            if !task.resume_if(PauseLevel::GracefulPause) {
                tracing::info!(task_id = %task.task_id(), level = ?task.pause_level(), "Pause changed during escalation; keeping it");
            }
            task.check_aborted(false).await?;
            Ok(response.approved)
        }
        None => {
            task.check_aborted(false).await?;
            Ok(true)
        }
    }
}

fn record_result(agent: &AgentContext, call: &ToolCall, result: &SandboxResult, status: ToolCallStatus, started_at: i64) {
    record_call(
        agent,
        call,
        result.execution_id.clone(),
        status,
        result.result.clone(),
        result.error.as_ref().map(|e| e.to_string()),
        started_at,
    );
}

fn record_call(
    agent: &AgentContext,
    call: &ToolCall,
    execution_id: String,
    status: ToolCallStatus,
    result: Option<String>,
    error: Option<String>,
    started_at: i64,
) {
    let record = ToolCallRecord {
        execution_id,
        tool_name: call.tool.clone(),
        args: call.args.clone(),
        status,
        result,
        error,
        started_at,
        finished_at: chrono::Utc::now().timestamp_millis(),
    };
    if !agent.task().chain().record_tool_call(agent.chain_entry(), record) {
        tracing::warn!(agent = %agent.agent_name(), "Chain entry already finished; tool call not recorded");
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() > OBSERVATION_PREVIEW_CHARS {
        format!("{}...", text.chars().take(OBSERVATION_PREVIEW_CHARS).collect::<String>())
    } else {
        text.to_string()
    }
}
