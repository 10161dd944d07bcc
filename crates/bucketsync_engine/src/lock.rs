//! Named locks guarding sync iterations and upload passes.
//!
//! Two locks exist: [`LockType::Sync`] for streaming iterations and
//! [`LockType::Crud`] for upload passes. They never nest. Hosts that share a
//! store between processes use [`FileLocks`]; a single process can use
//! [`InProcessLocks`].

use crate::cancel::CancelToken;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// The two named locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockType {
    /// One streaming iteration at a time.
    Sync,
    /// One upload pass at a time.
    Crud,
}

impl LockType {
    /// Returns the lock's name.
    pub fn as_str(self) -> &'static str {
        match self {
            LockType::Sync => "sync",
            LockType::Crud => "crud",
        }
    }
}

/// Held while a lock is owned. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockGuard {
    lock: LockType,
    _local: OwnedMutexGuard<()>,
    file: Option<File>,
}

impl LockGuard {
    /// Returns which lock this guard holds.
    pub fn lock_type(&self) -> LockType {
        self.lock
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(file) = &self.file {
            let _ = FileExt::unlock(file);
        }
    }
}

/// Host-provided named-mutex capability.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Waits for `lock`, giving up with [`SyncError::Cancelled`] when `cancel`
    /// fires first.
    async fn acquire(&self, lock: LockType, cancel: &CancelToken) -> SyncResult<LockGuard>;
}

/// Locks local to one process, FIFO-fair.
#[derive(Debug, Clone, Default)]
pub struct InProcessLocks {
    sync: Arc<Mutex<()>>,
    crud: Arc<Mutex<()>>,
}

impl InProcessLocks {
    /// Creates a fresh pair of locks.
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex(&self, lock: LockType) -> Arc<Mutex<()>> {
        match lock {
            LockType::Sync => Arc::clone(&self.sync),
            LockType::Crud => Arc::clone(&self.crud),
        }
    }

    async fn lock_local(
        &self,
        lock: LockType,
        cancel: &CancelToken,
    ) -> SyncResult<OwnedMutexGuard<()>> {
        let mutex = self.mutex(lock);
        tokio::select! {
            guard = mutex.lock_owned() => Ok(guard),
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
        }
    }
}

#[async_trait]
impl LockManager for InProcessLocks {
    async fn acquire(&self, lock: LockType, cancel: &CancelToken) -> SyncResult<LockGuard> {
        let local = self.lock_local(lock, cancel).await?;
        Ok(LockGuard {
            lock,
            _local: local,
            file: None,
        })
    }
}

/// Locks shared between processes through `<dir>/<name>.lock` files.
#[derive(Debug, Clone)]
pub struct FileLocks {
    dir: PathBuf,
    local: InProcessLocks,
    poll_interval: Duration,
}

impl FileLocks {
    /// Creates locks under `dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(dir: impl AsRef<Path>) -> SyncResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(bucketsync_store::StoreError::from)?;
        Ok(Self {
            dir,
            local: InProcessLocks::new(),
            poll_interval: Duration::from_millis(50),
        })
    }

    /// Sets how often a contended file lock is retried.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Returns the lock file path for `lock`.
    pub fn path(&self, lock: LockType) -> PathBuf {
        self.dir.join(format!("{}.lock", lock.as_str()))
    }
}

#[async_trait]
impl LockManager for FileLocks {
    async fn acquire(&self, lock: LockType, cancel: &CancelToken) -> SyncResult<LockGuard> {
        let local = self.local.lock_local(lock, cancel).await?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.path(lock))
            .map_err(bucketsync_store::StoreError::from)?;

        loop {
            if file.try_lock_exclusive().is_ok() {
                tracing::trace!(lock = lock.as_str(), "file lock acquired");
                return Ok(LockGuard {
                    lock,
                    _local: local,
                    file: Some(file),
                });
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn locks_are_independent() {
        let locks = InProcessLocks::new();
        let cancel = CancelToken::new();
        let sync = locks.acquire(LockType::Sync, &cancel).await.unwrap();
        let crud = locks.acquire(LockType::Crud, &cancel).await.unwrap();
        assert_eq!(sync.lock_type(), LockType::Sync);
        assert_eq!(crud.lock_type(), LockType::Crud);
    }

    #[tokio::test]
    async fn waiting_is_cancellable() {
        let locks = InProcessLocks::new();
        let cancel = CancelToken::new();
        let _held = locks.acquire(LockType::Sync, &cancel).await.unwrap();

        let waiter_cancel = cancel.child();
        let waiter = tokio::spawn({
            let locks = locks.clone();
            let waiter_cancel = waiter_cancel.clone();
            async move { locks.acquire(LockType::Sync, &waiter_cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter_cancel.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }

    #[tokio::test]
    async fn release_hands_over() {
        let locks = InProcessLocks::new();
        let cancel = CancelToken::new();
        let held = locks.acquire(LockType::Crud, &cancel).await.unwrap();

        let waiter = tokio::spawn({
            let locks = locks.clone();
            let cancel = cancel.clone();
            async move { locks.acquire(LockType::Crud, &cancel).await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn file_locks_exclude_other_managers() {
        let dir = tempdir().unwrap();
        let first = FileLocks::new(dir.path())
            .unwrap()
            .with_poll_interval(Duration::from_millis(5));
        let second = FileLocks::new(dir.path())
            .unwrap()
            .with_poll_interval(Duration::from_millis(5));
        let cancel = CancelToken::new();

        let held = first.acquire(LockType::Sync, &cancel).await.unwrap();
        assert!(first.path(LockType::Sync).exists());

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            second.acquire(LockType::Sync, &cancel),
        )
        .await;
        assert!(blocked.is_err());

        // The other lock name is free.
        second.acquire(LockType::Crud, &cancel).await.unwrap();

        drop(held);
        tokio::time::timeout(Duration::from_secs(1), second.acquire(LockType::Sync, &cancel))
            .await
            .unwrap()
            .unwrap();
    }
}
