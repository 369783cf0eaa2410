//! 结果缓存 - 基础设施层
//!
//! 按 "任务类型 + 内容" 的哈希保存 LLM 分析结果，避免重复调用。
//!
//! ## 存储布局
//!
//! ```text
//! <cache_dir>/
//!   3f/
//!     3fa9...e1.json        # 一个条目一个文件
//!     3fb2...07.json.corrupt  # 损坏条目的备份
//! ```
//!
//! 每个条目独立成文件，写入时先写临时文件再 rename，
//! 因此不同键的并发写互不影响，相同键的并发写只会留下某一次完整的结果。
//!
//! 缓存只是性能优化：`get` / `set` 的任何 I/O 错误都只记录日志，不向上传播。

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

use crate::error::CacheError;

/// 默认有效期：30 天
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// 任务类型与内容之间的分隔符
const KEY_SEPARATOR: char = '\u{1f}';

/// 条目中保存的内容预览长度（仅用于排查问题）
const PREVIEW_CHARS: usize = 100;

/// 计算缓存键
///
/// 键只由任务类型和规范化后的内容决定，与条目位置无关，跨进程稳定。
pub fn cache_key(task_type: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(task_type.as_bytes());
    hasher.update(KEY_SEPARATOR.to_string().as_bytes());
    hasher.update(normalize_content(content).as_bytes());
    hex::encode(hasher.finalize())
}

/// 规范化内容：统一换行符、去掉行尾空白和首尾空白
pub fn normalize_content(content: &str) -> String {
    content
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// 缓存条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub task_type: String,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
    /// 内容预览
    #[serde(default)]
    pub preview: String,
    pub result: Value,
}

impl CacheEntry {
    /// 只有 `now < created_at + ttl` 时条目有效
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        // 超出时间范围的有效期视为永不过期
        let expires_at = i64::try_from(self.ttl_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|ttl| self.created_at.checked_add_signed(ttl));
        match expires_at {
            Some(expires_at) => now >= expires_at,
            None => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// 缓存统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub total_size_bytes: u64,
    /// 过期或损坏的条目数
    pub expired_entries: usize,
    pub cache_dir: PathBuf,
}

/// 内容寻址的结果缓存
#[derive(Debug, Clone)]
pub struct ContentCache {
    cache_dir: PathBuf,
    default_ttl: Duration,
}

impl ContentCache {
    /// 创建缓存，目录不存在时自动创建
    pub fn new(cache_dir: impl Into<PathBuf>, default_ttl: Duration) -> Result<Self, CacheError> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir).map_err(|source| CacheError::CreateDirFailed {
            path: cache_dir.clone(),
            source,
        })?;

        info!(
            "结果缓存已初始化: {}, 有效期 {} 天",
            cache_dir.display(),
            default_ttl.as_secs() / 86_400
        );

        Ok(Self {
            cache_dir,
            default_ttl,
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// 查询缓存
    ///
    /// 条目不存在、已过期或已损坏时返回 `None`。
    pub fn get(&self, task_type: &str, content: &str) -> Option<Value> {
        let key = cache_key(task_type, content);
        let path = self.entry_path(&key);

        match read_entry(&path) {
            Ok(None) => {
                debug!("缓存未命中: {}...", short_key(&key));
                None
            }
            Ok(Some(entry)) if entry.key != key => {
                warn!("缓存条目键不一致, 视为损坏: {}", path.display());
                quarantine(&path);
                None
            }
            Ok(Some(entry)) if entry.is_expired() => {
                debug!("缓存已过期: {}...", short_key(&key));
                if let Err(e) = fs::remove_file(&path) {
                    debug!("删除过期缓存失败 {}: {}", path.display(), e);
                }
                None
            }
            Ok(Some(entry)) => {
                debug!("缓存命中: {}...", short_key(&key));
                Some(entry.result)
            }
            Err(CacheError::Corrupt { path, source }) => {
                warn!(
                    "检测到损坏的缓存文件 - 键: {}, 路径: {}, 错误: {}",
                    key,
                    path.display(),
                    source
                );
                quarantine(&path);
                None
            }
            Err(e) => {
                warn!("读取缓存失败, 按未命中处理: {}", e);
                None
            }
        }
    }

    /// 写入缓存（使用默认有效期）
    pub fn set(&self, task_type: &str, content: &str, result: &Value) {
        self.set_with_ttl(task_type, content, result, self.default_ttl);
    }

    /// 写入缓存，相同键会被覆盖
    pub fn set_with_ttl(&self, task_type: &str, content: &str, result: &Value, ttl: Duration) {
        let key = cache_key(task_type, content);
        let entry = CacheEntry {
            key: key.clone(),
            task_type: task_type.to_string(),
            created_at: Utc::now(),
            ttl_secs: ttl.as_secs(),
            preview: content.chars().take(PREVIEW_CHARS).collect(),
            result: result.clone(),
        };

        match self.write_entry(&entry) {
            Ok(()) => debug!("已缓存结果: {}...", short_key(&key)),
            Err(e) => error!("缓存结果失败: {}", e),
        }
    }

    /// 清理过期和损坏的条目，返回删除数量
    pub fn purge_expired(&self) -> usize {
        info!("正在清理过期缓存...");
        let now = Utc::now();
        let mut removed = 0;

        for path in self.entry_files() {
            let expired = match read_entry(&path) {
                Ok(Some(entry)) => entry.is_expired_at(now),
                // 其他进程刚刚删除
                Ok(None) => false,
                Err(e) => {
                    warn!("清理时发现损坏的缓存文件: {}", e);
                    backup_corrupt(&path);
                    true
                }
            };

            if expired {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => error!("删除缓存文件失败 {}: {}", path.display(), e),
                }
            }
        }

        info!("已清理 {} 个过期/损坏的缓存条目", removed);
        removed
    }

    /// 删除全部条目，返回删除数量
    pub fn clear_all(&self) -> usize {
        info!("正在清空全部缓存...");
        let mut removed = 0;
        for path in self.entry_files() {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => error!("删除缓存文件失败 {}: {}", path.display(), e),
            }
        }
        info!("已清空 {} 个缓存条目", removed);
        removed
    }

    /// 缓存统计
    pub fn stats(&self) -> CacheStats {
        let now = Utc::now();
        let mut stats = CacheStats {
            cache_dir: self.cache_dir.clone(),
            ..CacheStats::default()
        };

        for path in self.entry_files() {
            stats.total_entries += 1;
            stats.total_size_bytes += fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            match read_entry(&path) {
                Ok(Some(entry)) if !entry.is_expired_at(now) => {}
                _ => stats.expired_entries += 1,
            }
        }

        stats
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(&key[..2]).join(format!("{}.json", key))
    }

    fn write_entry(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let path = self.entry_path(&entry.key);
        let dir = path.parent().unwrap_or(&self.cache_dir);
        fs::create_dir_all(dir).map_err(|source| CacheError::CreateDirFailed {
            path: dir.to_path_buf(),
            source,
        })?;

        let write_failed = |source: std::io::Error| CacheError::WriteFailed {
            path: path.clone(),
            source,
        };

        let mut tmp = NamedTempFile::new_in(dir).map_err(write_failed)?;
        let bytes = serde_json::to_vec_pretty(entry).map_err(|source| CacheError::Corrupt {
            path: path.clone(),
            source,
        })?;
        tmp.write_all(&bytes).map_err(write_failed)?;
        tmp.persist(&path).map_err(|e| write_failed(e.error))?;
        Ok(())
    }

    /// 所有条目文件（`<dir>/<xx>/<key>.json`）
    fn entry_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let Ok(shards) = fs::read_dir(&self.cache_dir) else {
            error!("无法读取缓存目录: {}", self.cache_dir.display());
            return files;
        };

        for shard in shards.flatten() {
            let shard_path = shard.path();
            if !shard_path.is_dir() {
                continue;
            }
            let Ok(entries) = fs::read_dir(&shard_path) else {
                continue;
            };
            files.extend(
                entries
                    .flatten()
                    .map(|e| e.path())
                    .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("json")),
            );
        }

        files
    }
}

fn read_entry(path: &Path) -> Result<Option<CacheEntry>, CacheError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CacheError::ReadFailed {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| CacheError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

/// 备份并删除损坏的条目
fn quarantine(path: &Path) {
    backup_corrupt(path);
    match fs::remove_file(path) {
        Ok(()) => info!("已删除损坏的缓存: {}", path.display()),
        Err(e) => error!("删除损坏的缓存失败 {}: {}", path.display(), e),
    }
}

fn backup_corrupt(path: &Path) {
    let mut backup = path.as_os_str().to_owned();
    backup.push(".corrupt");
    match fs::copy(path, &backup) {
        Ok(_) => info!("损坏的缓存已备份至: {}", PathBuf::from(&backup).display()),
        Err(e) => error!("备份损坏的缓存失败: {}", e),
    }
}

fn short_key(key: &str) -> &str {
    &key[..key.len().min(8)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_cache(ttl: Duration) -> (TempDir, ContentCache) {
        let temp_dir = TempDir::new().unwrap();
        let cache = ContentCache::new(temp_dir.path().join("cache"), ttl).unwrap();
        (temp_dir, cache)
    }

    #[test]
    fn test_key_is_stable_and_normalized() {
        let a = cache_key("screening", "Title\r\nAbstract  \n");
        let b = cache_key("screening", "  Title\nAbstract");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        // 已知值：内容不变则跨进程不变
        assert_eq!(a, cache_key("screening", "Title\nAbstract"));
    }

    #[test]
    fn test_task_type_separates_entries() {
        let (_dir, cache) = create_test_cache(DEFAULT_CACHE_TTL);
        cache.set("questions-a", "same abstract", &json!({"answer": "yes"}));

        assert_eq!(
            cache.get("questions-a", "same abstract"),
            Some(json!({"answer": "yes"}))
        );
        assert_eq!(cache.get("questions-b", "same abstract"), None);
    }

    #[test]
    fn test_set_twice_returns_latest() {
        let (_dir, cache) = create_test_cache(DEFAULT_CACHE_TTL);
        cache.set("t", "content", &json!(1));
        cache.set("t", "content", &json!({"v": 2}));
        assert_eq!(cache.get("t", "content"), Some(json!({"v": 2})));
        assert_eq!(cache.stats().total_entries, 1);
    }

    #[test]
    fn test_zero_ttl_is_absent() {
        let (_dir, cache) = create_test_cache(DEFAULT_CACHE_TTL);
        cache.set_with_ttl("t", "content", &json!("x"), Duration::ZERO);
        assert_eq!(cache.get("t", "content"), None);
        // 过期条目在读取时被删除
        assert_eq!(cache.stats().total_entries, 0);
    }

    #[test]
    fn test_entry_expiry_boundary() {
        let created_at = Utc::now();
        let entry = CacheEntry {
            key: "k".into(),
            task_type: "t".into(),
            created_at,
            ttl_secs: 60,
            preview: String::new(),
            result: json!(null),
        };
        assert!(!entry.is_expired_at(created_at + chrono::Duration::seconds(59)));
        assert!(entry.is_expired_at(created_at + chrono::Duration::seconds(60)));
    }

    #[test]
    fn test_huge_ttl_never_expires() {
        let (_dir, cache) = create_test_cache(DEFAULT_CACHE_TTL);
        cache.set_with_ttl(
            "t",
            "content",
            &json!(1),
            Duration::from_secs(10_000_000_000_000_000),
        );
        assert_eq!(cache.get("t", "content"), Some(json!(1)));

        let entry = CacheEntry {
            key: "k".into(),
            task_type: "t".into(),
            created_at: Utc::now(),
            ttl_secs: u64::MAX,
            preview: String::new(),
            result: json!(null),
        };
        assert!(!entry.is_expired());
    }

    #[test]
    fn test_corrupt_entry_is_a_miss_and_backed_up() {
        let (_dir, cache) = create_test_cache(DEFAULT_CACHE_TTL);
        cache.set("t", "content", &json!(1));

        let path = cache.entry_path(&cache_key("t", "content"));
        fs::write(&path, b"{ not json").unwrap();

        assert_eq!(cache.get("t", "content"), None);
        assert!(!path.exists());
        let mut backup = path.as_os_str().to_owned();
        backup.push(".corrupt");
        assert!(PathBuf::from(backup).exists());
    }

    #[test]
    fn test_purge_expired_removes_only_expired() {
        let (_dir, cache) = create_test_cache(DEFAULT_CACHE_TTL);
        cache.set("t", "fresh", &json!(1));
        cache.set_with_ttl("t", "stale-1", &json!(2), Duration::ZERO);
        cache.set_with_ttl("t", "stale-2", &json!(3), Duration::ZERO);

        assert_eq!(cache.stats().expired_entries, 2);
        assert_eq!(cache.purge_expired(), 2);
        assert_eq!(cache.get("t", "fresh"), Some(json!(1)));
        assert_eq!(cache.stats().total_entries, 1);
    }

    #[test]
    fn test_clear_all() {
        let (_dir, cache) = create_test_cache(DEFAULT_CACHE_TTL);
        cache.set("t", "a", &json!(1));
        cache.set("t", "b", &json!(2));
        assert_eq!(cache.clear_all(), 2);
        assert_eq!(cache.get("t", "a"), None);
    }

    #[test]
    fn test_concurrent_writers_leave_readable_entry() {
        let (_dir, cache) = create_test_cache(DEFAULT_CACHE_TTL);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        cache.set("t", "shared", &json!({ "writer": i }));
                        cache.set("t", &format!("own-{}", i), &json!(i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let value = cache.get("t", "shared").unwrap();
        assert!(value["writer"].as_u64().unwrap() < 8);
        for i in 0..8 {
            assert_eq!(cache.get("t", &format!("own-{}", i)), Some(json!(i)));
        }
    }
}
