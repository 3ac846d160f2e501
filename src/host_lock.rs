//! Host-wide advisory locking.
//!
//! Every mutating operation against a worktree cache directory is serialized
//! across processes with a named file lock keyed by the cache directory path.
//! Different cache directories proceed fully in parallel.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};

/// Default acquisition timeout; worktree switches over large repositories
/// legitimately take minutes.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(600);

const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Named, host-wide advisory lock service. Lock files live under a single
/// directory and are keyed by a stable hash of the lock name, so the name may
/// contain arbitrary path characters.
#[derive(Debug, Clone)]
pub struct HostLocker {
    locks_dir: PathBuf,
}

impl Default for HostLocker {
    fn default() -> Self {
        Self {
            locks_dir: std::env::temp_dir().join("treesync-locks"),
        }
    }
}

impl HostLocker {
    pub fn new(locks_dir: impl Into<PathBuf>) -> Self {
        Self {
            locks_dir: locks_dir.into(),
        }
    }

    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.locks_dir
            .join(format!("{}.lock", fnv1a_hex(name)))
    }

    /// Run `f` under the named lock. Waits up to `timeout`, polling the
    /// cancellation token; the lock file itself is never deleted, so every
    /// process contends on the same inode.
    pub fn with_lock<T>(
        &self,
        name: &str,
        timeout: Duration,
        cancel: &CancelToken,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        fs::create_dir_all(&self.locks_dir).map_err(|e| {
            Error::io(
                format!("unable to create locks dir {}", self.locks_dir.display()),
                e,
            )
        })?;

        let path = self.lock_path(name);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::io(format!("unable to open lock file {}", path.display()), e))?;

        let deadline = Instant::now() + timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(Error::LockTimeout {
                            name: name.to_string(),
                            timeout,
                        });
                    }
                    thread::sleep(RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(Error::io(
                        format!("unable to lock {}", path.display()),
                        e,
                    ))
                }
            }
        }

        debug!(target: "treesync::host_lock", "acquired {name:?}");
        let result = f();
        let _ = fs2::FileExt::unlock(&file);
        result
    }
}

/// Stable 64-bit FNV-1a hash, 16 hex chars. Used to derive lock file names
/// from cache directory paths.
pub(crate) fn fnv1a_hex(s: &str) -> String {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 1099511628211;
    let mut h = FNV_OFFSET;
    for b in s.as_bytes() {
        h ^= u64::from(*b);
        h = h.wrapping_mul(FNV_PRIME);
    }
    format!("{h:016x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv_hash_is_stable() {
        assert_eq!(fnv1a_hex("a"), fnv1a_hex("a"));
        assert_ne!(fnv1a_hex("a"), fnv1a_hex("b"));
        assert_eq!(fnv1a_hex("x").len(), 16);
    }

    #[test]
    fn test_lock_path_differs_per_name() {
        let locker = HostLocker::default();
        assert_ne!(
            locker.lock_path("cache-a"),
            locker.lock_path("cache-b")
        );
    }
}
