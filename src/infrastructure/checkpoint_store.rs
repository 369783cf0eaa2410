//! 检查点存储 - 基础设施层
//!
//! 把部分结果表和进度元数据持久化到磁盘，程序崩溃或被用户终止后可以续跑。
//!
//! ## 文件
//!
//! 由输出路径 `<dir>/<stem>.<ext>` 推导：
//!
//! ```text
//! <dir>/<stem>.checkpoint.jsonl      # 结果表，每行 {"index": .., "outcome": ..}
//! <dir>/<stem>.checkpoint.meta.json  # 元数据，包含结果表的 SHA-256
//! <dir>/<stem>.checkpoint.lock       # 建议性文件锁
//! ```
//!
//! ## 保存协议
//!
//! 1. 获取写锁（默认最多等待 30 秒）
//! 2. 结果表和元数据分别写入同目录的临时文件并 fsync
//! 3. 先 rename 结果表，再 rename 元数据
//!
//! 第 3 步之间崩溃时，元数据中的摘要与新结果表不一致，`load` 会把它当作没有检查点；
//! 第 3 步之前崩溃时只留下临时文件，上一次的检查点保持完整。

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::CheckpointError;
use crate::infrastructure::file_lock::{FileLock, LockMode};
use crate::models::ItemOutcome;

/// 元数据格式版本
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;
/// 写锁默认超时
pub const DEFAULT_WRITE_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
/// 读锁默认超时
pub const DEFAULT_READ_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// 进度游标
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointCursor {
    /// 已完成（成功或失败）的条目索引
    pub completed: BTreeSet<usize>,
    /// 最近一个完成的条目索引
    pub last_index: Option<usize>,
}

/// 检查点元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub total: usize,
    pub task_type: String,
    pub saved_at: DateTime<Utc>,
    /// 调用方附加的自由元数据
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl CheckpointMetadata {
    pub fn new(total: usize, task_type: impl Into<String>) -> Self {
        Self {
            total,
            task_type: task_type.into(),
            saved_at: Utc::now(),
            extra: Map::new(),
        }
    }
}

/// 检查点
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    /// 按原始位置索引的部分结果表
    pub table: BTreeMap<usize, ItemOutcome>,
    pub cursor: CheckpointCursor,
    pub metadata: CheckpointMetadata,
}

impl Checkpoint {
    /// 空检查点
    pub fn empty(metadata: CheckpointMetadata) -> Self {
        Self {
            table: BTreeMap::new(),
            cursor: CheckpointCursor::default(),
            metadata,
        }
    }

    pub fn completed_count(&self) -> usize {
        self.cursor.completed.len()
    }
}

/// 磁盘上的元数据文件
#[derive(Debug, Serialize, Deserialize)]
struct MetaFile {
    version: u32,
    table_sha256: String,
    table_rows: usize,
    cursor: CheckpointCursor,
    metadata: CheckpointMetadata,
}

/// 结果表中的一行
#[derive(Debug, Serialize, Deserialize)]
struct TableRow {
    index: usize,
    outcome: ItemOutcome,
}

/// 检查点存储
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    table_path: PathBuf,
    meta_path: PathBuf,
    lock_path: PathBuf,
    write_lock_timeout: Duration,
    read_lock_timeout: Duration,
}

impl CheckpointStore {
    /// 由输出文件路径推导检查点文件名
    pub fn for_output(output_path: impl AsRef<Path>) -> Self {
        let output_path = output_path.as_ref();
        let dir = output_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let stem = output_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());

        Self {
            table_path: dir.join(format!("{}.checkpoint.jsonl", stem)),
            meta_path: dir.join(format!("{}.checkpoint.meta.json", stem)),
            lock_path: dir.join(format!("{}.checkpoint.lock", stem)),
            write_lock_timeout: DEFAULT_WRITE_LOCK_TIMEOUT,
            read_lock_timeout: DEFAULT_READ_LOCK_TIMEOUT,
        }
    }

    /// 自定义锁超时
    pub fn with_lock_timeouts(mut self, write: Duration, read: Duration) -> Self {
        self.write_lock_timeout = write;
        self.read_lock_timeout = read;
        self
    }

    pub fn table_path(&self) -> &Path {
        &self.table_path
    }

    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// 检查点文件是否都存在
    pub fn exists(&self) -> bool {
        self.table_path.exists() && self.meta_path.exists()
    }

    /// 原子地保存检查点
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let dir = self.dir();
        fs::create_dir_all(dir).map_err(|e| CheckpointError::io(dir, e))?;

        let _lock = FileLock::acquire(&self.lock_path, LockMode::Exclusive, self.write_lock_timeout)?;

        let table_bytes = encode_table(&checkpoint.table)?;
        let meta = MetaFile {
            version: CHECKPOINT_FORMAT_VERSION,
            table_sha256: sha256_hex(&table_bytes),
            table_rows: checkpoint.table.len(),
            cursor: checkpoint.cursor.clone(),
            metadata: checkpoint.metadata.clone(),
        };
        let meta_bytes = serde_json::to_vec_pretty(&meta)?;

        let table_tmp = write_temp(dir, &table_bytes)?;
        let meta_tmp = write_temp(dir, &meta_bytes)?;

        table_tmp
            .persist(&self.table_path)
            .map_err(|e| CheckpointError::PersistFailed {
                path: self.table_path.clone(),
                source: e.error,
            })?;
        meta_tmp
            .persist(&self.meta_path)
            .map_err(|e| CheckpointError::PersistFailed {
                path: self.meta_path.clone(),
                source: e.error,
            })?;

        debug!(
            "检查点已写入: {} ({} 行)",
            self.table_path.display(),
            checkpoint.table.len()
        );
        Ok(())
    }

    /// 读取最近一次完整的检查点
    ///
    /// 文件缺失、解析失败或结果表与元数据不一致时返回 `None`，调用方从头开始即可。
    pub fn load(&self) -> Option<Checkpoint> {
        if !self.exists() {
            debug!("未找到检查点: {}", self.meta_path.display());
            return None;
        }

        let _lock = match FileLock::acquire(&self.lock_path, LockMode::Shared, self.read_lock_timeout) {
            Ok(lock) => lock,
            Err(e) => {
                warn!("⚠️ 无法读取检查点, 将从头开始: {}", e);
                return None;
            }
        };

        match self.read_checkpoint() {
            Ok(checkpoint) => Some(checkpoint),
            Err(reason) => {
                warn!("⚠️ 检查点无效, 将从头开始: {}", reason);
                None
            }
        }
    }

    /// 删除检查点文件
    ///
    /// 在排他锁下删除结果表和元数据；锁文件保留，等待中的进程仍锁在同一个文件上。
    pub fn clear(&self) -> Result<(), CheckpointError> {
        if !self.table_path.exists() && !self.meta_path.exists() {
            return Ok(());
        }

        let _lock = FileLock::acquire(&self.lock_path, LockMode::Exclusive, self.write_lock_timeout)?;
        for path in [&self.table_path, &self.meta_path] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CheckpointError::io(path.as_path(), e)),
            }
        }
        info!("已清理检查点文件: {}", self.meta_path.display());
        Ok(())
    }

    /// 给用户看的续跑提示
    pub fn resume_summary(&self) -> Option<String> {
        let checkpoint = self.load()?;
        Some(format!(
            "发现 {} 保存的检查点\n已完成: {}/{} 个条目\n是否从检查点继续?",
            checkpoint
                .metadata
                .saved_at
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S"),
            checkpoint.completed_count(),
            checkpoint.metadata.total
        ))
    }

    fn dir(&self) -> &Path {
        self.table_path.parent().unwrap_or_else(|| Path::new("."))
    }

    fn read_checkpoint(&self) -> Result<Checkpoint, String> {
        let meta_bytes = fs::read(&self.meta_path).map_err(|e| format!("读取元数据失败: {}", e))?;
        let meta: MetaFile =
            serde_json::from_slice(&meta_bytes).map_err(|e| format!("元数据解析失败: {}", e))?;

        if meta.version != CHECKPOINT_FORMAT_VERSION {
            return Err(format!("不支持的检查点版本: {}", meta.version));
        }

        let table_bytes = fs::read(&self.table_path).map_err(|e| format!("读取结果表失败: {}", e))?;
        let digest = sha256_hex(&table_bytes);
        if digest != meta.table_sha256 {
            return Err("结果表与元数据不一致 (可能在保存过程中中断)".to_string());
        }

        let table = decode_table(&table_bytes)?;
        if table.len() != meta.table_rows {
            return Err(format!(
                "结果表行数 {} 与元数据记录的 {} 不一致",
                table.len(),
                meta.table_rows
            ));
        }

        Ok(Checkpoint {
            table,
            cursor: meta.cursor,
            metadata: meta.metadata,
        })
    }
}

fn encode_table(table: &BTreeMap<usize, ItemOutcome>) -> Result<Vec<u8>, CheckpointError> {
    let mut bytes = Vec::new();
    for (index, outcome) in table {
        let row = TableRow {
            index: *index,
            outcome: outcome.clone(),
        };
        serde_json::to_writer(&mut bytes, &row)?;
        bytes.push(b'\n');
    }
    Ok(bytes)
}

fn decode_table(bytes: &[u8]) -> Result<BTreeMap<usize, ItemOutcome>, String> {
    let text = std::str::from_utf8(bytes).map_err(|e| format!("结果表不是合法的 UTF-8: {}", e))?;
    let mut table = BTreeMap::new();
    for (line_no, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let row: TableRow = serde_json::from_str(line)
            .map_err(|e| format!("结果表第 {} 行解析失败: {}", line_no + 1, e))?;
        table.insert(row.index, row.outcome);
    }
    Ok(table)
}

fn write_temp(dir: &Path, bytes: &[u8]) -> Result<NamedTempFile, CheckpointError> {
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| CheckpointError::io(dir, e))?;
    tmp.write_all(bytes)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| CheckpointError::io(tmp.path(), e))?;
    Ok(tmp)
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
