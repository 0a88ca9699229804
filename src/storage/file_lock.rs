//! Cross-process mutual exclusion over a single lock file.
//!
//! Built on `fd-lock` (flock on unix, LockFileEx on windows), so a lock held by
//! a crashed process is released by the OS when its descriptor closes. Every
//! acquisition opens its own descriptor, which makes the lock exclusive between
//! threads and tasks of one process as well as between processes.
//!
//! Acquisition never blocks an executor thread: it polls `try_write` and sleeps
//! between attempts, giving up with [`LockError::Timeout`] once the configured
//! wait is exhausted.

use fd_lock::RwLock;
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Timed out after {waited_ms}ms waiting for lock {path:?}")]
    Timeout { path: PathBuf, waited_ms: u64 },

    #[error("Lock file {path:?} unavailable: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Exclusive lock keyed by a file path.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    timeout: Duration,
    poll_interval: Duration,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout: DEFAULT_LOCK_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<File, LockError> {
        let io_err = |source| LockError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .map_err(io_err)
    }

    /// Run `f` while holding the lock exclusively.
    ///
    /// The lock is released when `f` finishes, whether it returns `Ok`, `Err`,
    /// or the surrounding future is dropped.
    pub async fn run_exclusive<T, E, F, Fut>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let mut lock = RwLock::new(self.open()?);
        let started = Instant::now();

        loop {
            match lock.try_write() {
                Ok(_guard) => {
                    debug!(
                        path = ?self.path,
                        waited_ms = %started.elapsed().as_millis(),
                        "Acquired file lock"
                    );
                    return f().await;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(source) => {
                    return Err(LockError::Io {
                        path: self.path.clone(),
                        source,
                    }
                    .into());
                }
            }

            let waited = started.elapsed();
            if waited >= self.timeout {
                warn!(
                    path = ?self.path,
                    waited_ms = %waited.as_millis(),
                    "Gave up waiting for file lock"
                );
                return Err(LockError::Timeout {
                    path: self.path.clone(),
                    waited_ms: waited.as_millis() as u64,
                }
                .into());
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let lock = FileLock::new(temp_dir.path().join("nested/.locks/wfi_a.lock"));

        let value = lock
            .run_exclusive(|| async { Ok::<_, LockError>(42) })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert!(lock.path().exists());
    }

    #[tokio::test]
    async fn test_times_out_while_held_elsewhere() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("held.lock");

        let mut holder = RwLock::new(File::create(&path).unwrap());
        let _held = holder.try_write().unwrap();

        let lock = FileLock::new(&path)
            .with_timeout(Duration::from_millis(50))
            .with_poll_interval(Duration::from_millis(5));
        let result = lock
            .run_exclusive(|| async { Ok::<_, LockError>(()) })
            .await;

        assert!(matches!(result, Err(LockError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_released_after_error() {
        let temp_dir = TempDir::new().unwrap();
        let lock = FileLock::new(temp_dir.path().join("err.lock"))
            .with_timeout(Duration::from_millis(100));

        let failed: Result<(), LockError> = lock
            .run_exclusive(|| async {
                Err(LockError::Io {
                    path: PathBuf::from("inner"),
                    source: std::io::Error::new(ErrorKind::Other, "boom"),
                })
            })
            .await;
        assert!(failed.is_err());

        let again = lock
            .run_exclusive(|| async { Ok::<_, LockError>("second") })
            .await
            .unwrap();
        assert_eq!(again, "second");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_critical_sections_do_not_overlap() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("shared.lock");
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = FileLock::new(&path).with_poll_interval(Duration::from_millis(1));
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                lock.run_exclusive(|| async {
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, LockError>(())
                })
                .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
