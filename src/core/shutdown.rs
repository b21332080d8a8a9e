//! 优雅关闭
//!
//! 收到 Ctrl+C / SIGTERM（或手动调用 shutdown）时中止所有登记的任务：
//! 取消令牌被触发，在途工具调用被打断，Agent 循环在下一个 check_aborted 处退出。
//! 之后由 ShutdownCoordinator 依次执行清理（如为每个任务写最后一次检查点）。

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::task_context::TaskContext;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    FatalError(String),
}

/// 关闭信号：只触发一次，首个原因生效
#[derive(Default)]
pub struct ShutdownManager {
    signal: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
    /// 弱引用，任务释放后自动失效
    tasks: Mutex<Vec<Weak<TaskContext>>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 关闭时被取消的令牌，可交给其他后台循环
    pub fn token(&self) -> CancellationToken {
        self.signal.clone()
    }

    pub fn track(&self, task: &Arc<TaskContext>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| t.strong_count() > 0);
        tasks.push(Arc::downgrade(task));
    }

    pub fn tracked_tasks(&self) -> Vec<Arc<TaskContext>> {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.iter().filter_map(Weak::upgrade).collect()
    }

    /// 触发关闭并中止登记的任务；已关闭时返回 false 且不做任何事
    pub fn shutdown(&self, reason: ShutdownReason) -> bool {
        {
            let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason.clone());
        }
        let tasks = self.tracked_tasks();
        tracing::warn!(?reason, tasks = tasks.len(), "Shutting down, aborting tracked tasks");
        for task in &tasks {
            task.abort();
        }
        self.signal.cancel();
        true
    }

    pub fn is_shutdown(&self) -> bool {
        self.signal.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub async fn wait_for_shutdown(&self) {
        self.signal.cancelled().await;
    }

    /// 后台监听 Ctrl+C 与 SIGTERM（unix），先到者触发关闭
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let reason = tokio::select! {
                res = tokio::signal::ctrl_c() => match res {
                    Ok(()) => ShutdownReason::UserInitiated,
                    Err(e) => {
                        tracing::error!("Failed to listen for Ctrl+C: {}", e);
                        return;
                    }
                },
                _ = terminate() => ShutdownReason::Signal,
                _ = manager.wait_for_shutdown() => return,
            };
            tracing::info!(?reason, "Signal received");
            manager.shutdown(reason);
        });
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!("SIGTERM handler unavailable: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

/// 关闭后执行的清理步骤
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

/// 按登记顺序执行清理；单步超时或失败只记日志，不影响后续步骤
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    steps: Vec<Box<dyn ShutdownCleanup>>,
    step_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            steps: Vec::new(),
            step_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn register(&mut self, step: impl ShutdownCleanup + 'static) {
        self.steps.push(Box::new(step));
    }

    /// 返回失败（含超时）的步骤数
    pub async fn run_cleanup(&self) -> usize {
        let mut failed = 0;
        for step in &self.steps {
            match tokio::time::timeout(self.step_timeout, step.cleanup()).await {
                Ok(Ok(())) => tracing::info!(step = step.name(), "Cleanup done"),
                Ok(Err(e)) => {
                    failed += 1;
                    tracing::warn!(step = step.name(), "Cleanup failed: {}", e);
                }
                Err(_) => {
                    failed += 1;
                    tracing::warn!(step = step.name(), timeout_ms = self.step_timeout.as_millis() as u64, "Cleanup timed out");
                }
            }
        }
        failed
    }

    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }
}

/// 为每个仍存活的登记任务写最后一次检查点，并发送剩余状态变更
pub struct CheckpointCleanup {
    manager: Arc<ShutdownManager>,
}

impl CheckpointCleanup {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self { manager }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for CheckpointCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        for task in self.manager.tracked_tasks() {
            let checkpoint = task.create_checkpoint().await;
            tracing::info!(task_id = %checkpoint.task_id, checkpoint_id = %checkpoint.id, "Final checkpoint written");
            task.finish().await;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "task_checkpoint"
    }
}

/// 运行 app 直到它结束或收到关闭信号，然后执行 cleanup 并返回其结果
pub async fn run_with_graceful_shutdown<F, C, Fut>(manager: Arc<ShutdownManager>, app: F, cleanup: C) -> Fut::Output
where
    F: Future<Output = ()>,
    C: FnOnce() -> Fut,
    Fut: Future,
{
    manager.install_signal_handlers();
    tokio::select! {
        _ = app => tracing::info!("Application finished"),
        _ = manager.wait_for_shutdown() => tracing::info!(reason = ?manager.reason(), "Interrupted by shutdown"),
    }
    cleanup().await
}
