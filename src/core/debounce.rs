//! 状态变更防抖通知
//!
//! set_variable 立即写入变量表，然后把 (key, value) 放入待发送缓冲并重启一个短定时器；
//! 定时器到期时把缓冲中每个 key 的最后一个值各通知一次，然后清空缓冲。
//! 中间值不会被重放。

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;

/// 外部状态变更钩子（如推送到 UI）
#[async_trait]
pub trait StateChangeHook: Send + Sync {
    async fn on_state_change(&self, task_id: &str, key: &str, value: &Value) -> anyhow::Result<()>;
}

#[derive(Default)]
struct DebounceState {
    /// 按首次变脏顺序保存，每个 key 只保留最后的值
    pending: Vec<(String, Value)>,
    timer: Option<JoinHandle<()>>,
}

/// 防抖器：缓冲 + 单个待触发定时器
pub struct StateDebouncer {
    task_id: String,
    window: Duration,
    hook: Arc<dyn StateChangeHook>,
    state: Arc<Mutex<DebounceState>>,
}

impl StateDebouncer {
    pub fn new(task_id: impl Into<String>, window: Duration, hook: Arc<dyn StateChangeHook>) -> Self {
        Self {
            task_id: task_id.into(),
            window,
            hook,
            state: Arc::new(Mutex::new(DebounceState::default())),
        }
    }

    /// 记录一次变更并重启定时器；不在 tokio 运行时中时只缓冲，等待显式 flush
    pub fn push(&self, key: &str, value: Value) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.pending.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => state.pending.push((key.to_string(), value)),
        }
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(task_id = %self.task_id, "no runtime; state change buffered until flush");
            return;
        };
        let window = self.window;
        let shared = Arc::clone(&self.state);
        let hook = Arc::clone(&self.hook);
        let task_id = self.task_id.clone();
        state.timer = Some(handle.spawn(async move {
            tokio::time::sleep(window).await;
            let batch = {
                let mut state = shared.lock().unwrap_or_else(PoisonError::into_inner);
                state.timer = None;
                std::mem::take(&mut state.pending)
            };
            deliver(hook.as_ref(), &task_id, batch).await;
        }));
    }

    /// 立即发送缓冲中的全部变更（取消待触发的定时器）
    pub async fn flush(&self) {
        let batch = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            std::mem::take(&mut state.pending)
        };
        deliver(self.hook.as_ref(), &self.task_id, batch).await;
    }

    /// 丢弃缓冲与定时器（TaskContext::reset 调用）
    pub fn cancel(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.pending.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .len()
    }
}

async fn deliver(hook: &dyn StateChangeHook, task_id: &str, batch: Vec<(String, Value)>) {
    for (key, value) in batch {
        if let Err(e) = hook.on_state_change(task_id, &key, &value).await {
            tracing::warn!(task_id, key = %key, "State change hook failed: {}", e);
        }
    }
}
