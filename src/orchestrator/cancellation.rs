//! 协作式取消
//!
//! 取消只是一个单调的标志位：工作协程在开始处理条目之前检查它，
//! 已经发出的远程调用不会被强行中断。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

/// 取消令牌
///
/// 克隆出的令牌共享同一个标志位；一旦取消就不会再恢复。
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取消，重复调用无副作用
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            info!("🛑 已收到取消请求, 不再提交新的条目");
        }
    }

    /// 是否已取消（非阻塞）
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// 按名称管理多个取消令牌
///
/// 例如 GUI 的每个标签页各有一个正在运行的批处理。
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, CancellationToken>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为 `task_id` 创建新令牌；同名的旧任务会先被取消
    pub fn create(&self, task_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let mut tasks = self.tasks.lock();
        if let Some(previous) = tasks.insert(task_id.to_string(), token.clone()) {
            debug!("任务 {} 已存在, 取消旧任务", task_id);
            previous.cancel();
        }
        token
    }

    pub fn get(&self, task_id: &str) -> Option<CancellationToken> {
        self.tasks.lock().get(task_id).cloned()
    }

    /// 取消指定任务，任务不存在时返回 false
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.tasks.lock().get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// 取消全部任务
    pub fn cancel_all(&self) {
        for token in self.tasks.lock().values() {
            token.cancel();
        }
    }

    /// 移除已取消或已无人持有的任务
    pub fn cleanup_finished(&self) -> usize {
        let mut tasks = self.tasks.lock();
        let before = tasks.len();
        tasks.retain(|_, token| !token.is_cancelled() && Arc::strong_count(&token.cancelled) > 1);
        before - tasks.len()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_monotonic_and_idempotent() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_clones_share_state_across_threads() {
        let token = CancellationToken::new();
        let remote = token.clone();
        std::thread::spawn(move || remote.cancel()).join().unwrap();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_registry_replaces_and_cancels_previous() {
        let registry = TaskRegistry::new();
        let first = registry.create("abstract");
        let second = registry.create("abstract");

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_cancel_unknown_task() {
        let registry = TaskRegistry::new();
        assert!(!registry.cancel("missing"));
        let token = registry.create("matrix");
        assert!(registry.cancel("matrix"));
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_cleanup_finished_drops_cancelled_and_released() {
        let registry = TaskRegistry::new();
        let _running = registry.create("csv");
        let cancelled = registry.create("abstract");
        cancelled.cancel();
        drop(registry.create("matrix"));

        assert_eq!(registry.cleanup_finished(), 2);
        assert!(registry.get("csv").is_some());

        registry.cancel_all();
        assert_eq!(registry.cleanup_finished(), 1);
        assert!(registry.is_empty());
    }
}
