//! Bounded pool of parallel worktree cache directories.
//!
//! Slot 0 is the base cache directory itself; slot N (N >= 1) appends `-N`
//! to the base directory name. Acquisition blocks until a slot frees up,
//! checking for cancellation while waiting.

use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};

const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct WorktreePool {
    base_dir: PathBuf,
    taken: Mutex<Vec<bool>>,
    cond: Condvar,
}

impl WorktreePool {
    pub(crate) fn new(base_dir: PathBuf, size: usize) -> Self {
        let size = size.max(1);
        WorktreePool {
            base_dir,
            taken: Mutex::new(vec![false; size]),
            cond: Condvar::new(),
        }
    }

    pub fn size(&self) -> usize {
        match self.taken.lock() {
            Ok(taken) => taken.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Block until a slot is free and claim it. Returns a guard that
    /// releases the slot on drop.
    pub fn acquire(self: &Arc<Self>, cancel: &CancelToken) -> Result<PoolSlot> {
        let mut taken = self
            .taken
            .lock()
            .map_err(|_| Error::Other("worktree pool mutex poisoned".to_string()))?;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if let Some(slot) = taken.iter().position(|t| !t) {
                taken[slot] = true;
                return Ok(PoolSlot {
                    pool: Arc::clone(self),
                    slot,
                    dir: self.slot_dir(slot),
                });
            }
            let (guard, _timeout) = self
                .cond
                .wait_timeout(taken, ACQUIRE_POLL_INTERVAL)
                .map_err(|_| Error::Other("worktree pool mutex poisoned".to_string()))?;
            taken = guard;
        }
    }

    fn slot_dir(&self, slot: usize) -> PathBuf {
        if slot == 0 {
            self.base_dir.clone()
        } else {
            PathBuf::from(format!("{}-{slot}", self.base_dir.display()))
        }
    }

    fn release(&self, slot: usize) {
        let mut taken = match self.taken.lock() {
            Ok(taken) => taken,
            Err(poisoned) => poisoned.into_inner(),
        };
        taken[slot] = false;
        self.cond.notify_one();
    }
}

/// RAII slot claim; the cache directory in `dir` belongs to the holder
/// until the guard drops.
pub struct PoolSlot {
    pool: Arc<WorktreePool>,
    slot: usize,
    dir: PathBuf,
}

impl PoolSlot {
    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        self.pool.release(self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_slot_zero_is_base_dir() {
        let pool = Arc::new(WorktreePool::new(PathBuf::from("/tmp/cache/abc"), 2));
        let cancel = CancelToken::new();
        let a = pool.acquire(&cancel).expect("slot 0");
        let b = pool.acquire(&cancel).expect("slot 1");
        assert_eq!(a.dir(), &PathBuf::from("/tmp/cache/abc"));
        assert_eq!(b.dir(), &PathBuf::from("/tmp/cache/abc-1"));
    }

    #[test]
    fn test_acquire_blocks_until_release() {
        let pool = Arc::new(WorktreePool::new(PathBuf::from("/tmp/cache/xyz"), 1));
        let cancel = CancelToken::new();
        let slot = pool.acquire(&cancel).expect("first acquire");

        let pool2 = Arc::clone(&pool);
        let handle = thread::spawn(move || {
            let cancel = CancelToken::new();
            let started = Instant::now();
            let slot = pool2.acquire(&cancel).expect("second acquire");
            (started.elapsed(), slot.dir().clone())
        });

        thread::sleep(Duration::from_millis(150));
        drop(slot);

        let (waited, dir) = handle.join().expect("thread join");
        assert!(waited >= Duration::from_millis(100), "waited {waited:?}");
        assert_eq!(dir, PathBuf::from("/tmp/cache/xyz"));
    }

    #[test]
    fn test_third_acquire_waits_for_one_release() {
        let pool = Arc::new(WorktreePool::new(PathBuf::from("/tmp/cache/two"), 2));
        let cancel = CancelToken::new();
        let first = pool.acquire(&cancel).expect("slot 0");
        let _second = pool.acquire(&cancel).expect("slot 1");

        let pool2 = Arc::clone(&pool);
        let handle = thread::spawn(move || {
            let cancel = CancelToken::new();
            let slot = pool2.acquire(&cancel).expect("third acquire");
            slot.dir().clone()
        });

        thread::sleep(Duration::from_millis(150));
        drop(first);

        // The waiter gets exactly the freed slot.
        let dir = handle.join().expect("thread join");
        assert_eq!(dir, PathBuf::from("/tmp/cache/two"));
    }

    #[test]
    fn test_acquire_observes_cancellation() {
        let pool = Arc::new(WorktreePool::new(PathBuf::from("/tmp/cache/c"), 1));
        let cancel = CancelToken::new();
        let _held = pool.acquire(&cancel).expect("first acquire");

        let waiter_cancel = cancel.clone();
        let pool2 = Arc::clone(&pool);
        let handle = thread::spawn(move || pool2.acquire(&waiter_cancel));

        thread::sleep(Duration::from_millis(100));
        cancel.cancel();
        let result = handle.join().expect("thread join");
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn test_pool_size_floor_is_one() {
        let pool = WorktreePool::new(PathBuf::from("/tmp/cache/z"), 0);
        assert_eq!(pool.size(), 1);
    }
}
