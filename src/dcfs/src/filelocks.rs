use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use dcfs_lib::{DcfsError, DcfsResult};
use fs2::FileExt;
use log::debug;

const FLOCK_EXT: &str = "flock";

pub const DEFAULT_MAX_ACQUIRE_LOCK_CYCLES: u32 = 25;
pub const DEFAULT_LOCK_CYCLE_DURATION_FACTOR_MS: u64 = 30;

/// Advisory whole-file lock, released on drop. The lock lives on a `.flock`
/// sidecar so the guarded path itself can be renamed while held.
pub struct FlockGuard {
    file: Option<File>,
    path: PathBuf,
}

impl FlockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FlockGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = FileExt::unlock(&file) {
                debug!("unlock {} failed: {}", self.path.display(), e);
            }
        }
    }
}

/// Path of the lock sidecar guarding `path`.
pub fn flock_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    name.push('.');
    name.push_str(FLOCK_EXT);
    path.with_file_name(name)
}

#[derive(Clone, Copy, PartialEq)]
enum LockMode {
    Shared,
    Exclusive,
}

async fn acquire(
    path: &Path,
    mode: LockMode,
    max_cycles: u32,
    cycle_factor_ms: u64,
) -> DcfsResult<FlockGuard> {
    let lock_path = flock_path(path);
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(&lock_path)
        .map_err(|e| DcfsError::IoError(format!("open {} failed: {}", lock_path.display(), e)))?;

    let mut attempt: u32 = 0;
    loop {
        let locked = match mode {
            LockMode::Shared => FileExt::try_lock_shared(&file),
            LockMode::Exclusive => FileExt::try_lock_exclusive(&file),
        };
        match locked {
            Ok(()) => {
                return Ok(FlockGuard {
                    file: Some(file),
                    path: lock_path,
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                attempt += 1;
                if attempt > max_cycles {
                    return Err(DcfsError::LockTimeout(format!(
                        "gave up on {} after {} cycles",
                        lock_path.display(),
                        max_cycles
                    )));
                }
                tokio::time::sleep(Duration::from_millis(cycle_factor_ms * attempt as u64))
                    .await;
            }
            Err(e) => {
                return Err(DcfsError::IoError(format!(
                    "lock {} failed: {}",
                    lock_path.display(),
                    e
                )));
            }
        }
    }
}

/// Shared lock; multiple readers may hold it at once.
pub async fn acquire_read_lock(
    path: &Path,
    max_cycles: u32,
    cycle_factor_ms: u64,
) -> DcfsResult<FlockGuard> {
    acquire(path, LockMode::Shared, max_cycles, cycle_factor_ms).await
}

/// Exclusive lock; solitary holder, retried over bounded cycles with a
/// linearly growing sleep.
pub async fn acquire_write_lock(
    path: &Path,
    max_cycles: u32,
    cycle_factor_ms: u64,
) -> DcfsResult<FlockGuard> {
    acquire(path, LockMode::Exclusive, max_cycles, cycle_factor_ms).await
}
