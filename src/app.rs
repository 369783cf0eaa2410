//! 应用入口 - 编排层之上
//!
//! 负责组装各层：日志文件、缓存、检查点存储、LLM 适配器和取消信号，
//! 然后把输入文件交给 `BatchExecutor`，并把结果写成 JSON。

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::Config;
use crate::infrastructure::{CheckpointStore, ContentCache};
use crate::models::{load_items_from_toml, BatchResult};
use crate::orchestrator::{BatchExecutor, BatchOptions, TaskRegistry};
use crate::services::{LlmAdapter, LlmService};
use crate::utils::logging;

/// 一次运行的输入输出
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// `[[items]]` 格式的 TOML 输入文件
    pub input: PathBuf,
    /// 结果 JSON 文件，检查点文件放在它旁边
    pub output: PathBuf,
    /// 用户提示词模板文件，`{字段名}` 会被替换
    pub prompt: PathBuf,
    /// 可选的系统提示词文件
    pub system_prompt: Option<PathBuf>,
    /// 是否从检查点续跑
    pub resume: bool,
}

/// 应用主结构
pub struct App {
    config: Config,
    cache: Option<ContentCache>,
    registry: TaskRegistry,
}

impl App {
    /// 初始化应用
    pub async fn initialize(config: Config) -> Result<Self> {
        // 初始化日志文件
        logging::init_log_file(&config.output_log_file)?;

        logging::log_startup(&config);

        let cache = if config.enable_cache {
            let cache = ContentCache::new(&config.cache_dir, config.cache_ttl())
                .context("初始化缓存失败")?;
            let purged = cache.purge_expired();
            let stats = cache.stats();
            info!(
                "💾 缓存目录: {} ({} 条, 清理过期 {} 条)",
                stats.cache_dir.display(),
                stats.total_entries,
                purged
            );
            Some(cache)
        } else {
            None
        };

        Ok(Self {
            config,
            cache,
            registry: TaskRegistry::new(),
        })
    }

    /// 运行应用主逻辑
    pub async fn run(&self, request: &RunRequest) -> Result<BatchResult> {
        let items = load_items_from_toml(&request.input).await?;
        if items.is_empty() {
            warn!("⚠️ 输入文件中没有条目: {}", request.input.display());
        }

        let user_template = read_prompt(&request.prompt).await?;
        let mut adapter = LlmAdapter::new(LlmService::new(&self.config), user_template);
        if let Some(path) = &request.system_prompt {
            adapter = adapter.with_system_prompt(read_prompt(path).await?);
        }

        // 一个输出文件对应一个任务
        let task_id = request.output.display().to_string();
        let token = self.registry.create(&task_id);
        let signal_token = token.clone();
        let signal = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("🛑 收到 Ctrl-C, 不再提交新条目, 等待进行中的条目结束...");
                signal_token.cancel();
            }
        });

        let mut options = BatchOptions::from_config(&self.config)
            .with_cancellation_token(token)
            .resume(request.resume);
        options
            .checkpoint_metadata
            .insert("input".to_string(), request.input.display().to_string().into());
        if let Some(cache) = &self.cache {
            options = options.with_cache(cache.clone());
        }
        if self.config.enable_checkpoints {
            let store = CheckpointStore::for_output(&request.output).with_lock_timeouts(
                self.config.checkpoint_write_lock_timeout(),
                self.config.checkpoint_read_lock_timeout(),
            );
            if request.resume {
                if let Some(summary) = resume_summary(&store).await {
                    info!("♻️ {}", summary);
                }
            }
            options = options.with_checkpoint_store(store);
        }

        let mut executor = BatchExecutor::new(options);
        let result = executor.run(items, adapter).await;

        signal.abort();
        self.registry.cleanup_finished();

        let result = result?;
        write_result(&request.output, &result).await?;
        info!("\n结果已保存至: {}", request.output.display());
        info!("日志已保存至: {}", self.config.output_log_file);

        Ok(result)
    }
}

/// 读取检查点可能要等文件锁，放到阻塞线程池中执行
async fn resume_summary(store: &CheckpointStore) -> Option<String> {
    let store = store.clone();
    match tokio::task::spawn_blocking(move || store.resume_summary()).await {
        Ok(summary) => summary,
        Err(e) => {
            warn!("⚠️ 读取检查点摘要失败: {}", e);
            None
        }
    }
}

async fn read_prompt(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("无法读取提示词文件: {}", path.display()))
}

async fn write_result(path: &Path, result: &BatchResult) -> Result<()> {
    let json = serde_json::to_string_pretty(result).context("序列化结果失败")?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("无法写入结果文件: {}", path.display()))
}
