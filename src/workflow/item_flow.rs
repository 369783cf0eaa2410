//! 条目处理流程 - 流程层
//!
//! 核心职责：定义"一个条目"在工作协程中的处理流程
//!
//! 流程顺序：
//! 1. 检查取消令牌（已取消 → Skipped，不调用适配器）
//! 2. 在超时限制内调用适配器
//! 3. 成功的结果写入缓存
//!
//! 流程只返回结果，不写共享的结果表；汇总由编排层完成。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tracing::{error, info, warn};

use crate::infrastructure::ContentCache;
use crate::models::{Item, ItemError, ItemOutcome, SkipReason};
use crate::orchestrator::cancellation::CancellationToken;
use crate::services::ItemAdapter;

/// 单个条目的处理报告
#[derive(Debug, Clone)]
pub struct FlowReport {
    pub index: usize,
    pub outcome: ItemOutcome,
    /// 是否真正调用了适配器
    pub adapter_called: bool,
    pub elapsed: Duration,
}

/// 条目处理流程
///
/// - 不持有结果表
/// - 可以被多个工作协程共享（放在 `Arc` 中）
pub struct ItemFlow {
    adapter: Arc<dyn ItemAdapter>,
    cache: Option<ContentCache>,
    task_type: String,
    timeout: Duration,
    token: CancellationToken,
}

impl ItemFlow {
    pub fn new(
        adapter: Arc<dyn ItemAdapter>,
        cache: Option<ContentCache>,
        task_type: impl Into<String>,
        timeout: Duration,
        token: CancellationToken,
    ) -> Self {
        Self {
            adapter,
            cache,
            task_type: task_type.into(),
            timeout,
            token,
        }
    }

    pub async fn run(&self, item: Item) -> FlowReport {
        let started = Instant::now();

        // ========== 1. 开始前检查取消 ==========
        if self.token.is_cancelled() {
            info!("{} ⏭️ 已取消, 跳过", item);
            return FlowReport {
                index: item.index,
                outcome: ItemOutcome::Skipped {
                    reason: SkipReason::Cancelled,
                },
                adapter_called: false,
                elapsed: started.elapsed(),
            };
        }

        // ========== 2. 调用适配器 ==========
        info!("{} 🤖 开始分析...", item);
        let call = AssertUnwindSafe(self.adapter.analyze(&item)).catch_unwind();
        let outcome = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(Ok(payload))) => {
                // ========== 3. 写入缓存 ==========
                if let Some(cache) = &self.cache {
                    cache.set(&self.task_type, &item.content(), &payload);
                }
                info!("{} ✓ 分析完成 ({:.1}s)", item, started.elapsed().as_secs_f64());
                ItemOutcome::Success {
                    payload,
                    cached: false,
                }
            }
            Ok(Ok(Err(e))) => {
                error!("{} ❌ 分析失败: {:#}", item, e);
                ItemOutcome::Failed {
                    error: ItemError::adapter(&e),
                }
            }
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                error!("{} ❌ 适配器发生 panic: {}", item, message);
                ItemOutcome::Failed {
                    error: ItemError::panicked(message),
                }
            }
            Err(_) => {
                warn!("{} ⏱️ 处理超时 (超过 {} 秒)", item, self.timeout.as_secs_f64());
                ItemOutcome::Failed {
                    error: ItemError::timeout(self.timeout.as_secs_f64()),
                }
            }
        };

        FlowReport {
            index: item.index,
            outcome,
            adapter_called: true,
            elapsed: started.elapsed(),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "未知 panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ItemErrorKind;
    use crate::services::FnAdapter;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    async fn exploding(_item: Item) -> anyhow::Result<Value> {
        panic!("boom")
    }

    fn flow_with(adapter: impl ItemAdapter + 'static, timeout: Duration) -> ItemFlow {
        ItemFlow::new(
            Arc::new(adapter),
            None,
            "test",
            timeout,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_success_is_cached() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ContentCache::new(temp_dir.path(), Duration::from_secs(60)).unwrap();
        let adapter = FnAdapter::new(|item: Item| async move {
            Ok::<_, anyhow::Error>(json!({ "i": item.index }))
        });
        let flow = ItemFlow::new(
            Arc::new(adapter),
            Some(cache.clone()),
            "test",
            Duration::from_secs(5),
            CancellationToken::new(),
        );

        let item = Item::from_pairs(2, [("title", "A")]);
        let report = flow.run(item.clone()).await;
        assert!(report.adapter_called);
        assert_eq!(report.outcome.payload(), Some(&json!({ "i": 2 })));
        assert_eq!(cache.get("test", &item.content()), Some(json!({ "i": 2 })));
    }

    #[tokio::test]
    async fn test_cancelled_token_skips_without_calling_adapter() {
        let adapter = FnAdapter::new(exploding);
        let token = CancellationToken::new();
        token.cancel();
        let flow = ItemFlow::new(Arc::new(adapter), None, "test", Duration::from_secs(1), token);

        let report = flow.run(Item::from_pairs(0, [("t", "x")])).await;
        assert!(!report.adapter_called);
        assert_eq!(
            report.outcome,
            ItemOutcome::Skipped {
                reason: SkipReason::Cancelled
            }
        );
    }

    #[tokio::test]
    async fn test_timeout_becomes_failed() {
        let adapter = FnAdapter::new(|_item: Item| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, anyhow::Error>(Value::Null)
        });
        let flow = flow_with(adapter, Duration::from_millis(50));

        let report = flow.run(Item::from_pairs(0, [("t", "x")])).await;
        match report.outcome {
            ItemOutcome::Failed { error } => assert_eq!(error.kind, ItemErrorKind::Timeout),
            other => panic!("期望超时失败, 实际: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_failed() {
        let flow = flow_with(FnAdapter::new(exploding), Duration::from_secs(1));

        let report = flow.run(Item::from_pairs(0, [("t", "x")])).await;
        match report.outcome {
            ItemOutcome::Failed { error } => {
                assert_eq!(error.kind, ItemErrorKind::Panicked);
                assert_eq!(error.message, "boom");
            }
            other => panic!("期望 panic 失败, 实际: {:?}", other),
        }
    }
}
