//! Sentinel - 安全任务编排引擎
//!
//! 入口：加载配置、初始化日志、组装引擎，用脚本化 LLM 跑一个演示任务。
//! 需要审批的调用在终端询问（`--yes` 自动通过），Ctrl+C 触发优雅关闭并写最终检查点；
//! 用 `--task <id>` 重跑同一任务时先从该检查点恢复。

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::sync::{mpsc, Mutex};

use sentinel::agent::{build_system_prompt, create_engine_components, default_registry, process_task, workspace_root};
use sentinel::config::{load_config, AppConfig};
use sentinel::core::{run_with_graceful_shutdown, CheckpointCleanup, ShutdownCoordinator, ShutdownManager};
use sentinel::llm::ScriptedLlmClient;
use sentinel::react::ReactEvent;
use sentinel::security::{
    ApprovalHook, ApprovalRequest, ApprovalResponse, AuditFilter, AuditOutcome, SecurityContext,
};

/// 终端审批：打印请求并读一行 y/n
struct TerminalApproval {
    lines: Mutex<Lines<BufReader<Stdin>>>,
    auto_approve: bool,
}

impl TerminalApproval {
    fn new(auto_approve: bool) -> Self {
        Self {
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
            auto_approve,
        }
    }
}

#[async_trait]
impl ApprovalHook for TerminalApproval {
    async fn request_approval(
        &self,
        _ctx: &SecurityContext,
        request: &ApprovalRequest,
    ) -> anyhow::Result<ApprovalResponse> {
        if self.auto_approve {
            return Ok(ApprovalResponse::approved("auto"));
        }
        let kind = if request.escalation { "Escalation" } else { "Approval" };
        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(
                format!(
                    "\n[{kind}] {} ({}) args={}\n  reason: {}\n  approve? [y/N] ",
                    request.tool_name, request.level, request.args, request.reason
                )
                .as_bytes(),
            )
            .await?;
        stdout.flush().await?;

        let answer = self.lines.lock().await.next_line().await?.unwrap_or_default();
        if matches!(answer.trim(), "y" | "Y" | "yes") {
            Ok(ApprovalResponse::approved("terminal"))
        } else {
            Ok(ApprovalResponse::rejected("rejected at terminal"))
        }
    }
}

/// 演示脚本：写文件 → 读回 → 列目录 → shell（高风险，需要审批）→ 结束
fn demo_script() -> ScriptedLlmClient {
    ScriptedLlmClient::new([
        r#"{"tool": "write_file", "args": {"path": "notes.txt", "content": "sentinel demo\n"}}"#,
        r#"{"tool": "cat", "args": {"path": "notes.txt"}}"#,
        r#"[{"tool": "ls", "args": {"path": "."}}, {"tool": "echo", "args": {"text": "listing done"}}]"#,
        r#"{"tool": "shell", "args": {"command": "echo hello from shell"}}"#,
    ])
    .with_final_answer("Demo finished: notes.txt written and verified.")
}

fn print_event(event: &ReactEvent) {
    match event {
        ReactEvent::StepUpdate { agent, step, max_steps } => println!("[{agent}] step {step}/{max_steps}"),
        ReactEvent::Thinking { .. } => {}
        ReactEvent::ToolCall { agent, tool, args, attempt } => {
            println!("[{agent}] -> {tool} {args} (attempt {attempt})")
        }
        ReactEvent::Observation { agent, tool, preview } => println!("[{agent}] <- {tool}: {preview}"),
        ReactEvent::ToolFailure { agent, tool, reason } => println!("[{agent}] !! {tool}: {reason}"),
        ReactEvent::Recovery { agent, action, detail } => println!("[{agent}] recovery {action}: {detail}"),
        ReactEvent::Parked { agent, tool } => println!("[{agent}] parked on {tool}, waiting for operator"),
        ReactEvent::MessageDone { agent, text } => println!("[{agent}] {text}"),
        ReactEvent::Error { agent, text } => println!("[{agent}] error: {text}"),
    }
}

/// 从参数中取出 `flag <value>`；有 flag 没有值时报错
fn take_option(args: &mut Vec<String>, flag: &str) -> anyhow::Result<Option<String>> {
    let Some(i) = args.iter().position(|a| a == flag) else {
        return Ok(None);
    };
    if i + 1 >= args.len() {
        anyhow::bail!("{} requires a value", flag);
    }
    let value = args.remove(i + 1);
    args.remove(i);
    Ok(Some(value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sentinel::observability::init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let auto_approve = match args.iter().position(|a| a == "--yes") {
        Some(i) => {
            args.remove(i);
            true
        }
        None => false,
    };
    // 固定任务 id，才能从上次的检查点恢复
    let task_id = take_option(&mut args, "--task")?;
    let input = if args.is_empty() {
        "Write a short note into notes.txt and verify it.".to_string()
    } else {
        args.join(" ")
    };

    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!("Config load failed, using defaults: {}", e);
        AppConfig::default()
    });

    let workspace = workspace_root(&cfg);
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("Failed to create workspace {}", workspace.display()))?;

    let registry = default_registry(&workspace);
    let system_prompt = build_system_prompt(&registry);
    let approval: Arc<dyn ApprovalHook> = Arc::new(TerminalApproval::new(auto_approve));
    let components = Arc::new(
        create_engine_components(cfg, registry, Some(approval)).context("Failed to create engine components")?,
    );

    let resumable = task_id.is_some();
    let task = components.new_task(task_id);
    if resumable && components.resume_task(&task).await? {
        tracing::info!(task_id = %task.task_id(), "Resumed from checkpoint");
    }
    println!("Task {}", task.task_id());

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.track(&task);
    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&shutdown));
    coordinator.register(CheckpointCleanup::new(Arc::clone(&shutdown)));

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            print_event(&event);
        }
    });

    let llm = Arc::new(demo_script());
    let app = {
        let components = Arc::clone(&components);
        let task = Arc::clone(&task);
        async move {
            match process_task(&components, llm, &system_prompt, &task, "main", &input, Some(&event_tx)).await {
                Ok(result) => println!("\nResult ({} steps): {}", result.steps, result.response),
                Err(e) => {
                    eprintln!("\nAgent stopped: {}", e);
                    if let Some(entry) = &e.last_completed {
                        eprintln!(
                            "Last completed step: #{} {} ({} tool calls)",
                            entry.index,
                            entry.agent_name,
                            entry.tool_calls.len()
                        );
                    }
                }
            }
            drop(event_tx);
        }
    };

    let failed = run_with_graceful_shutdown(Arc::clone(&shutdown), app, || coordinator.run_cleanup()).await;
    if failed > 0 {
        tracing::warn!(failed, "Some cleanup steps failed");
    }
    let _ = printer.await;

    let entries = components.audit.query(&AuditFilter::task(task.task_id()));
    let count = |outcome: AuditOutcome| entries.iter().filter(|e| e.outcome == outcome).count();
    println!(
        "\nAudit: {} entries (success {}, failed {}, blocked {}, escalated {})",
        entries.len(),
        count(AuditOutcome::Success),
        count(AuditOutcome::Failed),
        count(AuditOutcome::Blocked),
        count(AuditOutcome::Escalated),
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_task_id_taken_from_args() {
        let mut argv = args(&["--task", "nightly", "summarize", "logs"]);
        assert_eq!(take_option(&mut argv, "--task").unwrap().as_deref(), Some("nightly"));
        assert_eq!(argv, args(&["summarize", "logs"]));

        let mut argv = args(&["summarize"]);
        assert_eq!(take_option(&mut argv, "--task").unwrap(), None);

        let mut argv = args(&["summarize", "--task"]);
        assert!(take_option(&mut argv, "--task").is_err());
    }
}
