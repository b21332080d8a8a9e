//! 任务上下文：取消、暂停状态机、检查点与防抖状态通知
//!
//! 每个任务一个实例，由该任务的所有 Agent 共享。
//! 协作式取消：所有长耗时步骤在挂起点调用 check_aborted；只有硬暂停会主动取消在途子操作。
//!
//! 状态：Running ⇄ GracefulPause，Running ⇄ HardPause，任意状态 → 取消（终态，直到 reset）。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::chain::ExecutionChain;
use crate::core::checkpoint::{CheckpointSink, TaskCheckpoint};
use crate::core::debounce::{StateChangeHook, StateDebouncer};
use crate::core::operations::{OperationGuard, OperationRegistry};
use crate::core::AgentError;
use crate::memory::{ConversationLog, Message};

/// 暂停级别（按严格程度排序）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseLevel {
    Running,
    /// 在途操作允许完成
    GracefulPause,
    /// 额外取消所有在途子操作
    HardPause,
}

/// 任务上下文的时间参数
#[derive(Debug, Clone)]
pub struct TaskSettings {
    /// 暂停期间轮询间隔
    pub pause_poll_interval: Duration,
    /// 状态变更防抖窗口
    pub state_debounce: Duration,
    /// 对话日志上限（0 表示不限制）
    pub max_conversation_messages: usize,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            pause_poll_interval: Duration::from_millis(500),
            state_debounce: Duration::from_millis(100),
            max_conversation_messages: 0,
        }
    }
}

pub struct TaskContext {
    task_id: String,
    settings: TaskSettings,
    variables: RwLock<HashMap<String, Value>>,
    conversation: RwLock<ConversationLog>,
    cancel_token: Mutex<CancellationToken>,
    pause: Mutex<PauseLevel>,
    operations: Arc<OperationRegistry>,
    chain: Arc<ExecutionChain>,
    state_hook: Option<Arc<dyn StateChangeHook>>,
    notifier: Option<StateDebouncer>,
    checkpoint_sink: Option<Arc<dyn CheckpointSink>>,
    checkpoint_timer: Mutex<Option<JoinHandle<()>>>,
}

impl TaskContext {
    pub fn new(task_id: impl Into<String>) -> Self {
        let settings = TaskSettings::default();
        Self {
            task_id: task_id.into(),
            conversation: RwLock::new(ConversationLog::new(settings.max_conversation_messages)),
            settings,
            variables: RwLock::new(HashMap::new()),
            cancel_token: Mutex::new(CancellationToken::new()),
            pause: Mutex::new(PauseLevel::Running),
            operations: Arc::new(OperationRegistry::new()),
            chain: Arc::new(ExecutionChain::new()),
            state_hook: None,
            notifier: None,
            checkpoint_sink: None,
            checkpoint_timer: Mutex::new(None),
        }
    }

    /// 以随机 id 创建
    pub fn generate() -> Self {
        Self::new(format!("task_{}", uuid::Uuid::new_v4()))
    }

    pub fn with_settings(mut self, settings: TaskSettings) -> Self {
        self.conversation = RwLock::new(ConversationLog::new(settings.max_conversation_messages));
        self.settings = settings;
        self.rebuild_notifier();
        self
    }

    pub fn with_state_hook(mut self, hook: Arc<dyn StateChangeHook>) -> Self {
        self.state_hook = Some(hook);
        self.rebuild_notifier();
        self
    }

    pub fn with_checkpoint_sink(mut self, sink: Arc<dyn CheckpointSink>) -> Self {
        self.checkpoint_sink = Some(sink);
        self
    }

    fn rebuild_notifier(&mut self) {
        self.notifier = self.state_hook.as_ref().map(|hook| {
            StateDebouncer::new(self.task_id.clone(), self.settings.state_debounce, Arc::clone(hook))
        });
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn chain(&self) -> &Arc<ExecutionChain> {
        &self.chain
    }

    // ---- 变量 ----

    pub async fn get_variable(&self, key: &str) -> Option<Value> {
        self.variables.read().await.get(key).cloned()
    }

    /// 立即写入，然后进入防抖通知。
    /// 写锁覆盖到 push 结束，保证缓冲中每个 key 的值与变量表一致。
    pub async fn set_variable(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let mut variables = self.variables.write().await;
        variables.insert(key.clone(), value.clone());
        if let Some(notifier) = &self.notifier {
            notifier.push(&key, value);
        }
    }

    pub async fn variables(&self) -> HashMap<String, Value> {
        self.variables.read().await.clone()
    }

    // ---- 对话日志 ----

    pub async fn push_message(&self, message: Message) {
        self.conversation.write().await.push(message);
    }

    pub async fn conversation(&self) -> Vec<Message> {
        self.conversation.read().await.messages().to_vec()
    }

    // ---- 取消与暂停 ----

    /// 当前代的取消令牌（reset 后会换新）
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token().is_cancelled()
    }

    pub fn pause_level(&self) -> PauseLevel {
        *self.pause.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 唯一同步点：已取消则返回 Cancelled；暂停时按轮询间隔等待，
    /// 每次醒来先检查取消，硬暂停时取消并清空全部在途子操作。
    pub async fn check_aborted(&self, ignore_pause: bool) -> Result<(), AgentError> {
        let token = self.cancellation_token();
        loop {
            if token.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            let level = self.pause_level();
            if ignore_pause || level == PauseLevel::Running {
                return Ok(());
            }
            if level == PauseLevel::HardPause {
                let aborted = self.operations.abort_all();
                if aborted > 0 {
                    tracing::info!(task_id = %self.task_id, aborted, "Hard pause aborted in-flight operations");
                }
            }
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(self.settings.pause_poll_interval) => {}
            }
        }
    }

    /// pause=false 恢复运行；abort_current=true 立即取消在途子操作（暂停时即硬暂停）
    pub fn set_pause(&self, pause: bool, abort_current: bool) {
        let level = match (pause, abort_current) {
            (false, _) => PauseLevel::Running,
            (true, false) => PauseLevel::GracefulPause,
            (true, true) => PauseLevel::HardPause,
        };
        self.set_pause_level(level);
        if abort_current && level != PauseLevel::HardPause {
            self.abort_operations();
        }
    }

    /// 仅当当前级别仍为 expected 时恢复运行；返回是否恢复
    pub fn resume_if(&self, expected: PauseLevel) -> bool {
        {
            let mut pause = self.pause.lock().unwrap_or_else(PoisonError::into_inner);
            if *pause != expected {
                return false;
            }
            *pause = PauseLevel::Running;
        }
        tracing::info!(task_id = %self.task_id, previous = ?expected, "Resumed");
        true
    }

    pub fn set_pause_level(&self, level: PauseLevel) {
        let previous = {
            let mut pause = self.pause.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *pause, level)
        };
        if previous != level {
            tracing::info!(task_id = %self.task_id, ?previous, ?level, "Pause level changed");
        }
        if level == PauseLevel::HardPause {
            self.abort_operations();
        }
    }

    fn abort_operations(&self) {
        let aborted = self.operations.abort_all();
        if aborted > 0 {
            tracing::info!(task_id = %self.task_id, aborted, "Aborted in-flight operations");
        }
    }

    /// 登记一个在途子操作；返回的令牌在硬暂停或任务取消时被取消
    pub fn register_operation(&self) -> (OperationGuard, CancellationToken) {
        let token = self.cancellation_token().child_token();
        let guard = self.operations.register_token(token.clone());
        (guard, token)
    }

    /// 登记自定义取消句柄（如外部 HTTP 请求的 abort）
    pub fn register_abort_handle(&self, abort: impl FnOnce() + Send + 'static) -> OperationGuard {
        self.operations.register(abort)
    }

    pub fn active_operations(&self) -> usize {
        self.operations.len()
    }

    /// 中止任务：触发取消、取消在途操作、停止检查点定时器
    pub fn abort(&self) {
        tracing::info!(task_id = %self.task_id, "Task aborted");
        self.cancellation_token().cancel();
        self.operations.abort_all();
        self.stop_checkpointing();
    }

    /// 原地重启：中止当前代，换新取消令牌，清除暂停与未发送的状态变更
    pub fn reset(&self) {
        let old = {
            let mut token = self.cancel_token.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *token, CancellationToken::new())
        };
        old.cancel();
        self.operations.abort_all();
        *self.pause.lock().unwrap_or_else(PoisonError::into_inner) = PauseLevel::Running;
        self.stop_checkpointing();
        if let Some(notifier) = &self.notifier {
            notifier.cancel();
        }
        tracing::info!(task_id = %self.task_id, "Task context reset");
    }

    /// 任务正常结束：发送剩余状态变更并停止定时器
    pub async fn finish(&self) {
        self.stop_checkpointing();
        if let Some(notifier) = &self.notifier {
            notifier.flush().await;
        }
    }

    // ---- 检查点 ----

    /// 按间隔周期性创建检查点；重复调用会替换旧定时器
    pub fn start_checkpointing(self: &Arc<Self>, interval: Duration) {
        self.stop_checkpointing();
        if interval.is_zero() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(ctx) = weak.upgrade() else {
                    break;
                };
                ctx.create_checkpoint().await;
            }
        });
        *self
            .checkpoint_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    pub fn stop_checkpointing(&self) {
        if let Some(handle) = self
            .checkpoint_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }

    pub fn is_checkpointing(&self) -> bool {
        self.checkpoint_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// 立即创建检查点并交给持久化钩子；钩子失败只记日志
    pub async fn create_checkpoint(&self) -> TaskCheckpoint {
        let checkpoint = TaskCheckpoint::new(
            self.task_id.clone(),
            self.variables().await,
            self.conversation().await,
            self.chain.progress(),
        );
        if let Some(sink) = &self.checkpoint_sink {
            if let Err(e) = sink.persist(&checkpoint).await {
                tracing::warn!(task_id = %self.task_id, "Checkpoint persistence failed: {}", e);
            }
        }
        checkpoint
    }

    /// 从检查点恢复变量与对话日志；不会恢复在途工具调用
    pub async fn restore(&self, checkpoint: &TaskCheckpoint) -> Result<(), AgentError> {
        if checkpoint.task_id != self.task_id {
            return Err(AgentError::Checkpoint(format!(
                "checkpoint belongs to task '{}', not '{}'",
                checkpoint.task_id, self.task_id
            )));
        }
        *self.variables.write().await = checkpoint.variables.clone();
        self.conversation
            .write()
            .await
            .replace(checkpoint.conversation.clone());
        tracing::info!(task_id = %self.task_id, checkpoint = %checkpoint.id, "Task restored from checkpoint");
        Ok(())
    }
}

impl Drop for TaskContext {
    fn drop(&mut self) {
        self.stop_checkpointing();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::debounce::tests::RecordingHook;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSink {
        count: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl CheckpointSink for CountingSink {
        async fn persist(&self, _checkpoint: &TaskCheckpoint) -> anyhow::Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("disk full");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_check_aborted_after_abort() {
        let ctx = TaskContext::new("t1");
        assert!(ctx.check_aborted(false).await.is_ok());
        ctx.abort();
        assert_eq!(ctx.check_aborted(false).await, Err(AgentError::Cancelled));
        assert_eq!(ctx.check_aborted(true).await, Err(AgentError::Cancelled));
    }

    #[tokio::test]
    async fn test_reset_installs_fresh_token() {
        let ctx = TaskContext::new("t1");
        ctx.abort();
        ctx.reset();
        assert!(ctx.check_aborted(false).await.is_ok());
        ctx.abort();
        assert_eq!(ctx.check_aborted(false).await, Err(AgentError::Cancelled));
    }

    #[tokio::test]
    async fn test_reset_cancels_previous_generation() {
        let ctx = TaskContext::new("t1");
        let old = ctx.cancellation_token();
        ctx.set_pause(true, false);
        ctx.reset();
        assert!(old.is_cancelled());
        assert!(!ctx.is_cancelled());
        assert_eq!(ctx.pause_level(), PauseLevel::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_pause_blocks_until_resume() {
        let ctx = Arc::new(TaskContext::new("t1"));
        ctx.set_pause(true, false);

        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.check_aborted(false).await })
        };
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!waiter.is_finished());

        ctx.set_pause(false, false);
        let result = waiter.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_wait_observes_cancellation() {
        let ctx = Arc::new(TaskContext::new("t1"));
        ctx.set_pause(true, false);
        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.check_aborted(false).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        ctx.abort();
        assert_eq!(waiter.await.unwrap(), Err(AgentError::Cancelled));
    }

    #[tokio::test]
    async fn test_ignore_pause_passes_through() {
        let ctx = TaskContext::new("t1");
        ctx.set_pause(true, false);
        assert!(ctx.check_aborted(true).await.is_ok());
    }

    #[tokio::test]
    async fn test_hard_pause_cancels_in_flight_exactly_once() {
        let ctx = TaskContext::new("t1");
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let _guard = ctx.register_abort_handle(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let (_op_guard, op_token) = ctx.register_operation();

        ctx.set_pause(true, true);
        assert_eq!(ctx.pause_level(), PauseLevel::HardPause);
        assert!(op_token.is_cancelled());
        assert_eq!(ctx.active_operations(), 0);

        // 轮询器再次醒来也不会重复调用
        ctx.set_pause_level(PauseLevel::HardPause);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abort_current_without_pause_keeps_running() {
        let ctx = TaskContext::new("t1");
        let (_guard, token) = ctx.register_operation();
        ctx.set_pause(false, true);
        assert!(token.is_cancelled());
        assert_eq!(ctx.pause_level(), PauseLevel::Running);
    }

    #[tokio::test]
    async fn test_operation_token_follows_task_cancel() {
        let ctx = TaskContext::new("t1");
        let (_guard, token) = ctx.register_operation();
        ctx.cancellation_token().cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_variable_debounced_notification() {
        let hook = Arc::new(RecordingHook::default());
        let ctx = TaskContext::new("t1").with_state_hook(hook.clone());
        for i in 0..10 {
            ctx.set_variable("count", serde_json::json!(i)).await;
        }
        assert_eq!(ctx.get_variable("count").await, Some(serde_json::json!(9)));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let calls = hook.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![("count".to_string(), serde_json::json!(9))]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_drops_pending_notifications() {
        let hook = Arc::new(RecordingHook::default());
        let ctx = TaskContext::new("t1").with_state_hook(hook.clone());
        ctx.set_variable("count", serde_json::json!(1)).await;
        ctx.reset();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(hook.calls.lock().unwrap().is_empty());
        assert_eq!(ctx.get_variable("count").await, Some(serde_json::json!(1)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_flush_the_stored_value() {
        let hook = Arc::new(RecordingHook::default());
        let ctx = Arc::new(
            TaskContext::new("t1")
                .with_settings(TaskSettings {
                    // 窗口足够长，只靠 finish 发送
                    state_debounce: Duration::from_secs(60),
                    ..TaskSettings::default()
                })
                .with_state_hook(hook.clone()),
        );

        let writers: Vec<_> = (0..8)
            .map(|w| {
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    for i in 0..200 {
                        ctx.set_variable("shared", serde_json::json!(w * 1_000 + i)).await;
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }
        ctx.finish().await;

        let stored = ctx.get_variable("shared").await.unwrap();
        let calls = hook.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![("shared".to_string(), stored)]);
    }

    #[tokio::test]
    async fn test_resume_if_keeps_other_levels() {
        let ctx = TaskContext::new("t1");
        ctx.set_pause(true, false);
        ctx.set_pause(true, true);
        assert!(!ctx.resume_if(PauseLevel::GracefulPause));
        assert_eq!(ctx.pause_level(), PauseLevel::HardPause);
        assert!(ctx.resume_if(PauseLevel::HardPause));
        assert_eq!(ctx.pause_level(), PauseLevel::Running);
    }

    #[tokio::test]
    async fn test_create_checkpoint_swallows_sink_failure() {
        let sink = Arc::new(CountingSink {
            fail: true,
            ..Default::default()
        });
        let ctx = TaskContext::new("t1").with_checkpoint_sink(sink.clone());
        ctx.set_variable("k", serde_json::json!("v")).await;
        ctx.push_message(Message::user("hello")).await;

        let ckpt = ctx.create_checkpoint().await;
        assert_eq!(ckpt.task_id, "t1");
        assert_eq!(ckpt.variables.get("k"), Some(&serde_json::json!("v")));
        assert_eq!(ckpt.conversation.len(), 1);
        assert_eq!(sink.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_checkpointing() {
        let sink = Arc::new(CountingSink::default());
        let ctx = Arc::new(TaskContext::new("t1").with_checkpoint_sink(sink.clone()));
        ctx.start_checkpointing(Duration::from_secs(1));
        assert!(ctx.is_checkpointing());

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(sink.count.load(Ordering::SeqCst), 3);

        ctx.stop_checkpointing();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sink.count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_restore_hydrates_state() {
        let source = TaskContext::new("t1");
        source.set_variable("page", serde_json::json!(3)).await;
        source.push_message(Message::assistant("step")).await;
        let ckpt = source.create_checkpoint().await;

        let resumed = TaskContext::new("t1");
        resumed.restore(&ckpt).await.unwrap();
        assert_eq!(resumed.get_variable("page").await, Some(serde_json::json!(3)));
        assert_eq!(resumed.conversation().await, vec![Message::assistant("step")]);

        let other = TaskContext::new("t2");
        assert!(matches!(other.restore(&ckpt).await, Err(AgentError::Checkpoint(_))));
    }
}
