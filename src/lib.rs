//! # Litscreen
//!
//! 一个用于批量分析文献条目的 Rust 批处理引擎
//!
//! ## 架构设计
//!
//! 本系统采用四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有磁盘资源，只暴露能力
//! - `ContentCache` - 按内容寻址的结果缓存（带有效期）
//! - `CheckpointStore` - 原子写入的断点续跑存储
//! - `FileLock` - 跨进程的检查点文件锁
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"，只处理单个条目
//! - `ItemAdapter` - 分析单个条目的能力
//! - `LlmService` / `LlmAdapter` - LLM 分析能力
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一个条目"的处理流程
//! - `ItemFlow` - 取消检查 → 超时内调用适配器 → 写缓存
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/batch_executor` - 并发控制、单点汇总、定期检查点
//! - `orchestrator/cancellation` - 协作式取消
//!
//! ## 模块结构

pub mod app;
pub mod config;
pub mod error;
pub mod infrastructure;
pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::Config;
pub use error::{AppError, AppResult};
pub use infrastructure::{CheckpointStore, ContentCache};
pub use models::{BatchResult, BatchStats, BatchStatus, Item, ItemError, ItemOutcome, SkipReason};
pub use orchestrator::{run_batch, BatchExecutor, BatchOptions, CancellationToken};
pub use services::{BlockingAdapter, FnAdapter, ItemAdapter};
