//! 带超时的建议性文件锁
//!
//! 检查点文件通过 rename 替换，锁加在独立的 `.lock` 文件上。

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::CheckpointError;

/// 轮询间隔
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// 加锁方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// 读锁，可与其他读锁共存
    Shared,
    /// 写锁
    Exclusive,
}

/// 持有期间保持文件锁，drop 时释放
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
    mode: LockMode,
}

impl FileLock {
    /// 在 `timeout` 内获取锁，超时返回 `CheckpointError::LockTimeout`
    pub fn acquire(path: &Path, mode: LockMode, timeout: Duration) -> Result<Self, CheckpointError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| CheckpointError::io(path, e))?;

        let started = Instant::now();
        loop {
            let attempt = match mode {
                LockMode::Shared => fs2::FileExt::try_lock_shared(&file),
                LockMode::Exclusive => fs2::FileExt::try_lock_exclusive(&file),
            };

            match attempt {
                Ok(()) => {
                    debug!("已获取文件锁 {:?}: {}", mode, path.display());
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                        mode,
                    });
                }
                Err(e) if is_contended(&e) => {
                    if started.elapsed() >= timeout {
                        return Err(CheckpointError::LockTimeout {
                            path: path.to_path_buf(),
                            waited_secs: started.elapsed().as_secs(),
                        });
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(CheckpointError::io(path, e)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_shared_locks_coexist() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.lock");

        let first = FileLock::acquire(&path, LockMode::Shared, Duration::from_millis(200)).unwrap();
        let second = FileLock::acquire(&path, LockMode::Shared, Duration::from_millis(200)).unwrap();
        assert_eq!(first.mode(), LockMode::Shared);
        assert_eq!(second.path(), path.as_path());
    }

    #[test]
    fn test_exclusive_lock_times_out_while_held() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("b.lock");

        let held = FileLock::acquire(&path, LockMode::Exclusive, Duration::from_secs(1)).unwrap();
        let second = FileLock::acquire(&path, LockMode::Exclusive, Duration::from_millis(150));
        assert!(matches!(second, Err(CheckpointError::LockTimeout { .. })));

        drop(held);
        assert!(FileLock::acquire(&path, LockMode::Exclusive, Duration::from_millis(150)).is_ok());
    }
}
