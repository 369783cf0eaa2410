/// 日志工具模块
///
/// 提供日志初始化、格式化和输出的辅助函数
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::models::{BatchStats, BatchStatus};

/// 初始化 tracing 订阅器
///
/// 优先使用 `RUST_LOG`；未设置时默认 `info`，`verbose` 为真时为 `debug`。
/// 重复调用不会报错。
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 初始化日志文件
///
/// # 参数
/// - `log_file_path`: 日志文件路径
pub fn init_log_file(log_file_path: impl AsRef<Path>) -> Result<()> {
    let path = log_file_path.as_ref();
    let log_header = format!(
        "{}\n文献批处理日志 - {}\n{}\n\n",
        "=".repeat(60),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        "=".repeat(60)
    );
    fs::write(path, log_header)
        .with_context(|| format!("无法创建日志文件: {}", path.display()))?;
    Ok(())
}

/// 记录程序启动信息
pub fn log_startup(config: &Config) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 文献批量分析模式");
    info!("📊 最大并发数: {}", config.max_workers);
    info!("⏱️ 单条超时: {} 秒", config.task_timeout_secs);
    info!(
        "💾 缓存: {} | 检查点: {} (每 {} 条)",
        on_off(config.enable_cache),
        on_off(config.enable_checkpoints),
        config.checkpoint_interval
    );
    info!("🤖 模型: {}", config.llm_model_name);
    info!("{}", "=".repeat(60));
}

/// 记录批处理开始信息
///
/// # 参数
/// - `total`: 条目总数
/// - `max_workers`: 最大并发数
/// - `task_type`: 任务类型
pub fn log_batch_start(total: usize, max_workers: usize, task_type: &str) {
    info!("\n{}", "=".repeat(60));
    info!("📦 开始批处理: {} 个条目 (任务类型: {})", total, task_type);
    info!("📋 最多同时处理 {} 个", max_workers);
    info!("{}", "=".repeat(60));
}

/// 记录待处理数量
pub fn log_pending(pending: usize, restored: usize, cache_hits: usize) {
    if restored > 0 || cache_hits > 0 {
        info!(
            "✓ 检查点恢复 {} 个, 缓存命中 {} 个, 剩余 {} 个待分析",
            restored, cache_hits, pending
        );
    } else {
        info!("✓ 共 {} 个条目待分析", pending);
    }
}

/// 打印最终统计信息
pub fn print_final_stats(stats: &BatchStats, status: &BatchStatus) {
    info!("\n{}", "=".repeat(60));
    info!("📊 批处理完成统计");
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    match status {
        BatchStatus::Completed => info!("🏁 状态: 已完成"),
        BatchStatus::Cancelled => info!("🛑 状态: 已取消"),
        BatchStatus::Failed { reason } => info!("💥 状态: 失败 ({})", reason),
    }
    info!("✅ 成功: {}/{}", stats.success, stats.total);
    info!("❌ 失败: {}", stats.failed);
    info!("⏭️ 跳过: {}", stats.skipped);
    info!(
        "⚡ 缓存命中: {} | ♻️ 检查点恢复: {} | 🤖 适配器调用: {}",
        stats.cache_hits, stats.restored, stats.adapter_calls
    );
    info!("💾 检查点保存次数: {}", stats.checkpoint_saves);
    info!("{}", "=".repeat(60));
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大字符数
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "开启"
    } else {
        "关闭"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_truncate_counts_chars_not_bytes() {
        assert_eq!(truncate_text("文献筛选工具", 4), "文献筛选...");
        assert_eq!(truncate_text("short", 10), "short");
    }

    #[test]
    fn test_init_log_file_writes_header() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("run.log");
        init_log_file(&path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("文献批处理日志"));
        assert!(content.starts_with(&"=".repeat(60)));
    }

    #[test]
    fn test_init_can_be_called_twice() {
        init(false);
        init(true);
    }
}
