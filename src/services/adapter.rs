//! 条目适配器 - 业务能力层
//!
//! 适配器负责"分析一个条目"：通常是一次远程 LLM 调用。
//! 它不持有共享状态，可以被多个工作协程同时调用。

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::models::Item;

/// 分析单个条目的能力
#[async_trait]
pub trait ItemAdapter: Send + Sync {
    /// 分析一个条目，返回可序列化的结果
    async fn analyze(&self, item: &Item) -> Result<Value>;
}

#[async_trait]
impl<A: ItemAdapter + ?Sized> ItemAdapter for Arc<A> {
    async fn analyze(&self, item: &Item) -> Result<Value> {
        (**self).analyze(item).await
    }
}

/// 用异步闭包实现的适配器
pub struct FnAdapter<F> {
    func: F,
}

impl<F, Fut> FnAdapter<F>
where
    F: Fn(Item) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> ItemAdapter for FnAdapter<F>
where
    F: Fn(Item) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn analyze(&self, item: &Item) -> Result<Value> {
        (self.func)(item.clone()).await
    }
}

/// 包装同步函数的适配器
///
/// 函数在 tokio 的阻塞线程池中执行，不会占用异步工作线程。
pub struct BlockingAdapter<F> {
    func: Arc<F>,
}

impl<F> BlockingAdapter<F>
where
    F: Fn(&Item) -> Result<Value> + Send + Sync + 'static,
{
    pub fn new(func: F) -> Self {
        Self {
            func: Arc::new(func),
        }
    }
}

#[async_trait]
impl<F> ItemAdapter for BlockingAdapter<F>
where
    F: Fn(&Item) -> Result<Value> + Send + Sync + 'static,
{
    async fn analyze(&self, item: &Item) -> Result<Value> {
        let func = Arc::clone(&self.func);
        let item = item.clone();
        match tokio::task::spawn_blocking(move || func(&item)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(anyhow::anyhow!("阻塞任务被中止: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_blocking_adapter_runs_sync_function() {
        let adapter = BlockingAdapter::new(|item: &Item| {
            Ok(json!({ "len": item.field("title").unwrap_or_default().len() }))
        });
        let item = Item::from_pairs(0, [("title", "abcd")]);

        let rt = tokio::runtime::Runtime::new().unwrap();
        let value = rt.block_on(adapter.analyze(&item)).unwrap();
        assert_eq!(value, json!({ "len": 4 }));
    }

    #[test]
    fn test_fn_adapter_propagates_errors() {
        let adapter = FnAdapter::new(|item: Item| async move {
            if item.index == 1 {
                anyhow::bail!("ConnectionError")
            }
            Ok::<_, anyhow::Error>(json!(item.index))
        });

        let ok = tokio_test::block_on(adapter.analyze(&Item::from_pairs(0, [("t", "a")])));
        assert_eq!(ok.unwrap(), json!(0));
        let err = tokio_test::block_on(adapter.analyze(&Item::from_pairs(1, [("t", "b")])));
        assert_eq!(err.unwrap_err().to_string(), "ConnectionError");
    }
}
