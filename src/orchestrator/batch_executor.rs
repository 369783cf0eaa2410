//! 批处理执行器 - 编排层
//!
//! ## 职责
//!
//! 把一批互相独立的条目分发给最多 W 个工作协程，并负责：
//!
//! 1. **断点续跑**：从检查点恢复已完成的条目
//! 2. **缓存短路**：命中缓存的条目直接记为成功，不占用工作协程
//! 3. **并发控制**：同时在途的条目不超过 `max_workers`
//! 4. **单点汇总**：只有当前协程写结果表，工作协程只返回结果
//! 5. **定期检查点**：每完成 `checkpoint_interval` 个条目保存一次
//! 6. **协作式取消**：取消后不再提交新条目，在途条目自然结束
//!
//! ## 状态
//!
//! ```text
//! Idle → Running → Completed | Cancelled | Failed
//! ```
//!
//! 条目级的失败（适配器报错、超时、panic）只是结果数据；
//! 只有检查点多次重试后仍无法写入时整个批处理才进入 `Failed`，
//! 此时已有的结果依然完整返回。

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::task::{self, JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult, CheckpointError, ExecutorError};
use crate::infrastructure::{Checkpoint, CheckpointMetadata, CheckpointStore, ContentCache};
use crate::models::{
    BatchResult, BatchStats, BatchStatus, Item, ItemError, ItemOutcome, SkipReason,
};
use crate::orchestrator::cancellation::CancellationToken;
use crate::services::ItemAdapter;
use crate::utils::logging;
use crate::workflow::{FlowReport, ItemFlow};

/// 进度回调：`(已完成数量, 总数)`，在汇总协程中调用
pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// 批处理选项
#[derive(Clone)]
pub struct BatchOptions {
    /// 最大并发数 W（至少为 1）
    pub max_workers: usize,
    /// 单个条目的超时时间
    pub per_item_timeout: Duration,
    /// 每完成 K 个条目保存一次检查点（至少为 1）
    pub checkpoint_interval: usize,
    /// 任务类型标签，参与缓存键计算并写入检查点
    pub task_type: String,
    pub cache: Option<ContentCache>,
    pub checkpoint_store: Option<CheckpointStore>,
    pub cancellation_token: Option<CancellationToken>,
    /// 是否从检查点续跑
    pub resume_from_checkpoint: bool,
    /// 全部成功时删除检查点（否则保存最终检查点）
    pub clear_checkpoint_on_success: bool,
    /// 续跑时是否重新处理检查点中失败的条目
    pub retry_failed_on_resume: bool,
    /// 检查点保存的最大尝试次数
    pub checkpoint_max_attempts: u32,
    /// 检查点重试的初始等待时间（指数退避）
    pub checkpoint_retry_delay: Duration,
    pub progress_callback: Option<ProgressCallback>,
    /// 写入检查点元数据的附加信息
    pub checkpoint_metadata: Map<String, Value>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_workers: 3,
            per_item_timeout: Duration::from_secs(600),
            checkpoint_interval: 5,
            task_type: "default".to_string(),
            cache: None,
            checkpoint_store: None,
            cancellation_token: None,
            resume_from_checkpoint: false,
            clear_checkpoint_on_success: true,
            retry_failed_on_resume: false,
            checkpoint_max_attempts: 3,
            checkpoint_retry_delay: Duration::from_secs(2),
            progress_callback: None,
            checkpoint_metadata: Map::new(),
        }
    }
}

impl fmt::Debug for BatchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchOptions")
            .field("max_workers", &self.max_workers)
            .field("per_item_timeout", &self.per_item_timeout)
            .field("checkpoint_interval", &self.checkpoint_interval)
            .field("task_type", &self.task_type)
            .field("cache", &self.cache.as_ref().map(|c| c.cache_dir().to_path_buf()))
            .field("checkpoint_store", &self.checkpoint_store)
            .field("resume_from_checkpoint", &self.resume_from_checkpoint)
            .field("clear_checkpoint_on_success", &self.clear_checkpoint_on_success)
            .field("retry_failed_on_resume", &self.retry_failed_on_resume)
            .field("checkpoint_max_attempts", &self.checkpoint_max_attempts)
            .field("progress_callback", &self.progress_callback.is_some())
            .finish()
    }
}

impl BatchOptions {
    /// 从程序配置生成选项（不含缓存与检查点，由调用方决定是否启用）
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_workers: config.max_workers,
            per_item_timeout: config.task_timeout(),
            checkpoint_interval: config.checkpoint_interval,
            task_type: config.task_type.clone(),
            checkpoint_max_attempts: config.checkpoint_max_attempts,
            ..Self::default()
        }
    }

    pub fn with_cache(mut self, cache: ContentCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_checkpoint_store(mut self, store: CheckpointStore) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    pub fn with_progress_callback(mut self, callback: impl Fn(usize, usize) + Send + Sync + 'static) -> Self {
        self.progress_callback = Some(Arc::new(callback));
        self
    }

    pub fn resume(mut self, resume: bool) -> Self {
        self.resume_from_checkpoint = resume;
        self
    }

    fn validate(&self) -> AppResult<()> {
        if self.max_workers == 0 {
            return Err(AppError::invalid_options("max_workers", "必须至少为 1"));
        }
        if self.checkpoint_interval == 0 {
            return Err(AppError::invalid_options("checkpoint_interval", "必须至少为 1"));
        }
        if self.per_item_timeout.is_zero() {
            return Err(AppError::invalid_options("per_item_timeout", "必须大于 0"));
        }
        if self.checkpoint_max_attempts == 0 {
            return Err(AppError::invalid_options("checkpoint_max_attempts", "必须至少为 1"));
        }
        Ok(())
    }
}

/// 执行器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// 批处理执行器
#[derive(Debug)]
pub struct BatchExecutor {
    options: BatchOptions,
    state: ExecutorState,
}

/// 运行 `items` 并按输入顺序返回结果
pub async fn run_batch<A>(items: Vec<Item>, adapter: A, options: BatchOptions) -> AppResult<BatchResult>
where
    A: ItemAdapter + 'static,
{
    BatchExecutor::new(options).run(items, adapter).await
}

impl BatchExecutor {
    pub fn new(options: BatchOptions) -> Self {
        Self {
            options,
            state: ExecutorState::Idle,
        }
    }

    pub fn state(&self) -> ExecutorState {
        self.state
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    /// 执行批处理
    ///
    /// 只有选项或输入不合法时返回 `Err`；条目失败、取消和检查点故障都体现在 `BatchResult` 中。
    pub async fn run<A>(&mut self, items: Vec<Item>, adapter: A) -> AppResult<BatchResult>
    where
        A: ItemAdapter + 'static,
    {
        self.options.validate()?;
        for (position, item) in items.iter().enumerate() {
            if item.index != position {
                return Err(ExecutorError::IndexMismatch {
                    position,
                    index: item.index,
                }
                .into());
            }
        }

        self.state = ExecutorState::Running;
        let total = items.len();
        let token = self.options.cancellation_token.clone().unwrap_or_default();
        let mut run = RunState::new(total, &self.options);

        logging::log_batch_start(total, self.options.max_workers, &self.options.task_type);

        // ========== 1. 从检查点恢复 ==========
        if self.options.resume_from_checkpoint {
            self.restore(&mut run).await;
        }

        // ========== 2. 查询缓存 ==========
        let mut pending = VecDeque::with_capacity(total);
        for item in items {
            if run.outcomes[item.index].is_some() {
                continue;
            }
            let cached = self
                .options
                .cache
                .as_ref()
                .and_then(|cache| cache.get(&self.options.task_type, &item.content()));
            match cached {
                Some(payload) => {
                    debug!("{} ⚡ 命中缓存", item);
                    run.stats.cache_hits += 1;
                    run.settle(
                        item.index,
                        ItemOutcome::Success {
                            payload,
                            cached: true,
                        },
                    );
                    self.report_progress(&run);
                }
                None => pending.push_back(item),
            }
        }

        logging::log_pending(pending.len(), run.stats.restored, run.stats.cache_hits);

        // ========== 3/4/5. 分发、汇总、定期检查点 ==========
        let flow = Arc::new(ItemFlow::new(
            Arc::new(adapter),
            self.options.cache.clone(),
            self.options.task_type.clone(),
            self.options.per_item_timeout,
            token.clone(),
        ));
        let mut in_flight = JoinSet::new();
        let mut task_index = HashMap::new();
        let mut completions = 0usize;

        loop {
            while in_flight.len() < self.options.max_workers
                && run.failure.is_none()
                && !token.is_cancelled()
            {
                let Some(item) = pending.pop_front() else {
                    break;
                };
                let index = item.index;
                let flow = Arc::clone(&flow);
                let handle = in_flight.spawn(async move { flow.run(item).await });
                task_index.insert(handle.id(), index);
            }

            let Some(joined) = in_flight.join_next_with_id().await else {
                break;
            };

            let report = match joined {
                Ok((id, report)) => {
                    task_index.remove(&id);
                    report
                }
                Err(e) => match crashed_report(&mut task_index, e) {
                    Some(report) => report,
                    None => continue,
                },
            };

            if report.adapter_called {
                run.stats.adapter_calls += 1;
            }
            let settled = report.outcome.is_settled();
            run.settle(report.index, report.outcome);
            self.report_progress(&run);

            if settled {
                completions += 1;
                if completions % self.options.checkpoint_interval == 0 && run.failure.is_none() {
                    self.checkpoint(&mut run).await;
                }
            }
        }

        // 未提交的条目
        let skip_reason = if run.failure.is_some() {
            SkipReason::Aborted
        } else {
            SkipReason::Cancelled
        };
        if !pending.is_empty() {
            for item in pending {
                run.settle(item.index, ItemOutcome::Skipped { reason: skip_reason });
            }
            self.report_progress(&run);
        }

        // ========== 6. 收尾：清理或保存最终检查点 ==========
        let any_skipped = run
            .outcomes
            .iter()
            .any(|o| matches!(o, Some(ItemOutcome::Skipped { .. })));
        let all_success = run
            .outcomes
            .iter()
            .all(|o| matches!(o, Some(ItemOutcome::Success { .. })));

        if run.failure.is_none() {
            if let Some(store) = self.options.checkpoint_store.clone() {
                if all_success && self.options.clear_checkpoint_on_success {
                    match tokio::task::spawn_blocking(move || store.clear()).await {
                        Ok(Ok(())) => info!("处理完成，已清理检查点文件"),
                        Ok(Err(e)) => warn!("⚠️ 清理检查点失败: {}", e),
                        Err(e) => warn!("⚠️ 清理检查点失败: {}", e),
                    }
                } else {
                    self.checkpoint(&mut run).await;
                }
            }
        }

        let status = if let Some(reason) = run.failure.clone() {
            BatchStatus::Failed { reason }
        } else if token.is_cancelled() && any_skipped {
            BatchStatus::Cancelled
        } else {
            BatchStatus::Completed
        };

        self.state = match status {
            BatchStatus::Completed => ExecutorState::Completed,
            BatchStatus::Cancelled => ExecutorState::Cancelled,
            BatchStatus::Failed { .. } => ExecutorState::Failed,
        };

        let result = run.finish(status);
        logging::print_final_stats(&result.stats, &result.status);
        Ok(result)
    }

    /// 从检查点恢复已完成的条目
    async fn restore(&self, run: &mut RunState) {
        let Some(store) = self.options.checkpoint_store.clone() else {
            warn!("⚠️ 要求从检查点续跑, 但未配置检查点存储");
            return;
        };

        let loaded = match tokio::task::spawn_blocking(move || store.load()).await {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!("⚠️ 读取检查点失败, 将从头开始: {}", e);
                None
            }
        };
        let Some(checkpoint) = loaded else {
            info!("未找到可用的检查点, 从头开始");
            return;
        };

        if checkpoint.metadata.total != run.total {
            warn!(
                "⚠️ 检查点条目总数 {} 与本次 {} 不一致, 忽略检查点",
                checkpoint.metadata.total, run.total
            );
            return;
        }
        if checkpoint.metadata.task_type != self.options.task_type {
            warn!(
                "⚠️ 检查点任务类型 '{}' 与本次 '{}' 不一致, 忽略检查点",
                checkpoint.metadata.task_type, self.options.task_type
            );
            return;
        }

        for (index, outcome) in checkpoint.table {
            if index >= run.total || !checkpoint.cursor.completed.contains(&index) {
                continue;
            }
            if !outcome.is_settled() {
                continue;
            }
            if outcome.is_failed() && self.options.retry_failed_on_resume {
                continue;
            }
            run.stats.restored += 1;
            run.settle(index, outcome);
        }

        info!(
            "♻️ 从检查点恢复，已完成 {}/{} 个条目",
            run.stats.restored, run.total
        );
        self.report_progress(run);
    }

    /// 保存检查点；多次失败后记录批处理失败
    async fn checkpoint(&self, run: &mut RunState) {
        let Some(store) = self.options.checkpoint_store.as_ref() else {
            return;
        };

        match self.save_with_retry(store, &run.checkpoint).await {
            Ok(()) => {
                run.stats.checkpoint_saves += 1;
                info!("💾 检查点已保存 (进度: {}/{})", run.done, run.total);
            }
            Err(e) => {
                error!("❌ {}", e);
                run.failure = Some(e.to_string());
            }
        }
    }

    async fn save_with_retry(
        &self,
        store: &CheckpointStore,
        checkpoint: &Checkpoint,
    ) -> Result<(), CheckpointError> {
        let attempts = self.options.checkpoint_max_attempts;
        let mut delay = self.options.checkpoint_retry_delay;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let store = store.clone();
            let mut snapshot = checkpoint.clone();
            snapshot.metadata.saved_at = Utc::now();

            match tokio::task::spawn_blocking(move || store.save(&snapshot)).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => {
                    warn!("⚠️ 检查点保存失败 (第 {}/{} 次): {}", attempt, attempts, e);
                    last_error = e.to_string();
                }
                Err(e) => {
                    warn!("⚠️ 检查点保存任务异常 (第 {}/{} 次): {}", attempt, attempts, e);
                    last_error = e.to_string();
                }
            }

            if attempt < attempts {
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
        }

        Err(CheckpointError::RetriesExhausted {
            attempts,
            last_error,
        })
    }

    fn report_progress(&self, run: &RunState) {
        if let Some(callback) = &self.options.progress_callback {
            callback(run.done, run.total);
        }
    }
}

/// 工作协程异常退出时，把它记为对应条目的 panic 失败
///
/// 找不到对应条目时只记录日志，不写任何位置。
fn crashed_report(task_index: &mut HashMap<task::Id, usize>, e: JoinError) -> Option<FlowReport> {
    let Some(index) = task_index.remove(&e.id()) else {
        error!("未知的工作协程异常退出 (id: {}): {}", e.id(), e);
        return None;
    };
    error!("[条目 {}] 工作协程异常退出: {}", index, e);
    Some(FlowReport {
        index,
        outcome: ItemOutcome::Failed {
            error: ItemError::panicked(e.to_string()),
        },
        adapter_called: true,
        elapsed: Duration::ZERO,
    })
}

/// 单次运行的汇总状态，只在汇总协程中修改
struct RunState {
    total: usize,
    outcomes: Vec<Option<ItemOutcome>>,
    /// 检查点暂存区
    checkpoint: Checkpoint,
    stats: BatchStats,
    done: usize,
    failure: Option<String>,
}

impl RunState {
    fn new(total: usize, options: &BatchOptions) -> Self {
        let mut metadata = CheckpointMetadata::new(total, options.task_type.clone());
        metadata.extra = options.checkpoint_metadata.clone();

        Self {
            total,
            outcomes: vec![None; total],
            checkpoint: Checkpoint::empty(metadata),
            stats: BatchStats {
                total,
                ..BatchStats::default()
            },
            done: 0,
            failure: None,
        }
    }

    /// 把结果写到原始位置；成功和失败同时进入检查点暂存区
    fn settle(&mut self, index: usize, outcome: ItemOutcome) {
        if outcome.is_settled() {
            self.checkpoint.table.insert(index, outcome.clone());
            self.checkpoint.cursor.completed.insert(index);
            self.checkpoint.cursor.last_index = Some(index);
        }
        if self.outcomes[index].replace(outcome).is_none() {
            self.done += 1;
        }
    }

    fn finish(self, status: BatchStatus) -> BatchResult {
        let mut stats = self.stats;
        let outcomes: Vec<ItemOutcome> = self
            .outcomes
            .into_iter()
            .map(|o| {
                o.unwrap_or(ItemOutcome::Skipped {
                    reason: SkipReason::Cancelled,
                })
            })
            .collect();

        stats.success = outcomes.iter().filter(|o| o.is_success()).count();
        stats.failed = outcomes.iter().filter(|o| o.is_failed()).count();
        stats.skipped = outcomes.iter().filter(|o| o.is_skipped()).count();

        BatchResult {
            status,
            outcomes,
            stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::FnAdapter;
    use serde_json::json;

    fn items(n: usize) -> Vec<Item> {
        (0..n)
            .map(|i| Item::from_pairs(i, [("title", format!("paper {}", i))]))
            .collect()
    }

    fn echo_adapter() -> impl ItemAdapter {
        FnAdapter::new(|item: Item| async move { Ok::<_, anyhow::Error>(json!(item.index)) })
    }

    #[tokio::test]
    async fn test_invalid_options_rejected_before_work() {
        let options = BatchOptions {
            max_workers: 0,
            ..BatchOptions::default()
        };
        let err = run_batch(items(3), echo_adapter(), options).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Executor(ExecutorError::InvalidOptions { .. })
        ));
    }

    #[tokio::test]
    async fn test_index_mismatch_rejected() {
        let mut input = items(2);
        input[1].index = 5;
        let err = run_batch(input, echo_adapter(), BatchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Executor(ExecutorError::IndexMismatch { position: 1, index: 5 })
        ));
    }

    #[tokio::test]
    async fn test_empty_batch_completes() {
        let mut executor = BatchExecutor::new(BatchOptions::default());
        assert_eq!(executor.state(), ExecutorState::Idle);

        let result = executor.run(Vec::new(), echo_adapter()).await.unwrap();
        assert!(result.is_empty());
        assert_eq!(result.status, BatchStatus::Completed);
        assert_eq!(executor.state(), ExecutorState::Completed);
    }

    #[tokio::test]
    async fn test_progress_reaches_total() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let options = BatchOptions::default()
            .with_progress_callback(move |done, total| sink.lock().push((done, total)));

        let result = run_batch(items(5), echo_adapter(), options).await.unwrap();
        assert_eq!(result.stats.success, 5);

        let seen = seen.lock();
        assert_eq!(seen.len(), 5);
        assert_eq!(seen.last(), Some(&(5, 5)));
        assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
    }

    async fn crashed_task() -> (task::Id, JoinError) {
        let mut set = JoinSet::new();
        set.spawn(async { panic!("worker crashed") });
        match set.join_next_with_id().await {
            Some(Err(e)) => (e.id(), e),
            other => panic!("期望任务 panic, 实际: {:?}", other.map(|r| r.is_ok())),
        }
    }

    #[tokio::test]
    async fn test_crashed_worker_maps_to_its_item() {
        let (id, err) = crashed_task().await;
        let mut task_index = HashMap::from([(id, 4usize)]);

        let report = crashed_report(&mut task_index, err).unwrap();
        assert_eq!(report.index, 4);
        assert!(task_index.is_empty());
        match report.outcome {
            ItemOutcome::Failed { error } => {
                assert_eq!(error.kind, crate::models::ItemErrorKind::Panicked)
            }
            other => panic!("期望 panic 失败, 实际: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_crashed_worker_with_unknown_id_is_dropped() {
        let (_, err) = crashed_task().await;
        let mut task_index = HashMap::new();
        assert!(crashed_report(&mut task_index, err).is_none());
    }

    #[test]
    fn test_settle_counts_each_slot_once() {
        let mut run = RunState::new(2, &BatchOptions::default());
        run.settle(
            0,
            ItemOutcome::Skipped {
                reason: SkipReason::Cancelled,
            },
        );
        run.settle(
            0,
            ItemOutcome::Success {
                payload: json!(0),
                cached: false,
            },
        );
        assert_eq!(run.done, 1);
        assert!(run.checkpoint.cursor.completed.contains(&0));
    }
}
