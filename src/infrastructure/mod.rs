//! 基础设施层（Infrastructure）
//!
//! 持有磁盘上的共享资源，只暴露能力，不认识批处理流程：
//!
//! - `content_cache` - 内容寻址的结果缓存
//! - `checkpoint_store` - 原子替换的检查点存储
//! - `file_lock` - 带超时的建议性文件锁

pub mod checkpoint_store;
pub mod content_cache;
pub mod file_lock;

pub use checkpoint_store::{Checkpoint, CheckpointCursor, CheckpointMetadata, CheckpointStore};
pub use content_cache::{cache_key, CacheEntry, CacheStats, ContentCache, DEFAULT_CACHE_TTL};
pub use file_lock::{FileLock, LockMode};
