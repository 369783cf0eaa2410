//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责批量调度，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `batch_executor` - 批处理执行器
//! - 校验选项，从检查点恢复，查询缓存
//! - 用 `JoinSet` 控制在途条目数量
//! - 单点汇总结果，定期保存检查点
//! - 输出全局统计信息
//!
//! ### `cancellation` - 协作式取消
//! - `CancellationToken`：一次性的取消标志
//! - `TaskRegistry`：按任务 ID 管理多个令牌
//!
//! ## 层次关系
//!
//! ```text
//! batch_executor (处理 Vec<Item>)
//!     ↓
//! workflow::ItemFlow (处理单个 Item)
//!     ↓
//! services (能力层：ItemAdapter / LLM)
//!     ↓
//! infrastructure (基础设施：ContentCache / CheckpointStore)
//! ```

pub mod batch_executor;
pub mod cancellation;

// 重新导出主要类型
pub use batch_executor::{
    run_batch, BatchExecutor, BatchOptions, ExecutorState, ProgressCallback,
};
pub use cancellation::{CancellationToken, TaskRegistry};
