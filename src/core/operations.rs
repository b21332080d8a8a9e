//! 在途子操作登记表
//!
//! 工具调用、子网络请求等在执行期间登记一个取消句柄；硬暂停时逐个调用并清空。
//! 句柄只在操作运行期间存在：OperationGuard 析构时自动注销。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

type AbortFn = Box<dyn FnOnce() + Send>;

/// 子操作登记表：call id -> 取消句柄
#[derive(Default)]
pub struct OperationRegistry {
    next_id: AtomicU64,
    handles: Mutex<HashMap<u64, AbortFn>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记任意取消句柄；FnOnce 保证每个句柄至多被调用一次
    pub fn register(self: &Arc<Self>, abort: impl FnOnce() + Send + 'static) -> OperationGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Box::new(abort));
        OperationGuard {
            id,
            registry: Arc::clone(self),
        }
    }

    /// 登记一个以 CancellationToken 表示的子操作
    pub fn register_token(self: &Arc<Self>, token: CancellationToken) -> OperationGuard {
        self.register(move || token.cancel())
    }

    /// 取消全部在途操作并清空登记表，返回被取消的数量
    pub fn abort_all(&self) -> usize {
        let drained: Vec<AbortFn> = {
            let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
            handles.drain().map(|(_, f)| f).collect()
        };
        let count = drained.len();
        for abort in drained {
            abort();
        }
        count
    }

    pub fn len(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn unregister(&self, id: u64) {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

/// 子操作存活凭证：析构即注销（不会触发取消）
pub struct OperationGuard {
    id: u64,
    registry: Arc<OperationRegistry>,
}

impl OperationGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}
