use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use nix::fcntl::{Flock, FlockArg};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Failed to open lock file {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to lock {path}: {source}")]
    Flock {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Lock task failed: {0}")]
    Task(String),
}

/// Exclusive access to one site. Released when dropped.
pub struct SiteGuard {
    _file: Option<Flock<File>>,
    _local: OwnedMutexGuard<()>,
}

/// Keyed lock: operations on the same site run one at a time, operations on
/// different sites run concurrently.
///
/// Within a process waiters queue on an async mutex. With a lock directory,
/// the holder also takes an `flock` on `<dir>/site-<id>.lock` so separate
/// hostpanel processes serialize too.
#[derive(Debug, Default)]
pub struct SiteLocks {
    locks: Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
    dir: Option<PathBuf>,
}

impl SiteLocks {
    /// Serialize within this process only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize across every process sharing `dir`.
    pub fn shared(dir: impl Into<PathBuf>) -> Self {
        Self {
            locks: Mutex::default(),
            dir: Some(dir.into()),
        }
    }

    /// Wait for exclusive access to `site_id`.
    pub async fn lock(&self, site_id: i64) -> Result<SiteGuard, LockError> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            // Drop entries nobody holds or waits on.
            locks.retain(|id, l| *id == site_id || Arc::strong_count(l) > 1);
            locks.entry(site_id).or_default().clone()
        };
        debug!(site_id, "Waiting for site lock");
        let local = lock.lock_owned().await;

        let file = match self.dir {
            Some(ref dir) => Some(lock_file(dir.join(format!("site-{}.lock", site_id))).await?),
            None => None,
        };
        Ok(SiteGuard {
            _file: file,
            _local: local,
        })
    }

    /// Number of sites with a live in-process lock entry.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn lock_file(path: PathBuf) -> Result<Flock<File>, LockError> {
    tokio::task::spawn_blocking(move || {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| LockError::Open {
                path: path.clone(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| LockError::Open {
                path: path.clone(),
                source,
            })?;
        Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| LockError::Flock {
            path,
            source: errno.into(),
        })
    })
    .await
    .map_err(|e| LockError::Task(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_site_is_serialized() {
        let locks = Arc::new(SiteLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let (locks, inside, peak) = (locks.clone(), inside.clone(), peak.clone());
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(7).await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_sites_do_not_block() {
        let locks = SiteLocks::new();
        let _a = locks.lock(1).await.unwrap();
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(2)).await;
        assert!(matches!(b, Ok(Ok(_))));
    }

    #[tokio::test]
    async fn test_idle_entries_are_pruned() {
        let locks = SiteLocks::new();
        drop(locks.lock(1).await.unwrap());
        drop(locks.lock(2).await.unwrap());
        drop(locks.lock(3).await.unwrap());
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn test_separate_instances_share_file_lock() {
        let dir = tempfile::tempdir().unwrap();
        let first = SiteLocks::shared(dir.path());
        let second = SiteLocks::shared(dir.path());

        let held = first.lock(1).await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(150), second.lock(1)).await;
        assert!(blocked.is_err(), "second instance acquired site 1 while first held it");

        let other_site = tokio::time::timeout(Duration::from_millis(500), second.lock(2)).await;
        assert!(matches!(other_site, Ok(Ok(_))));

        drop(held);
        let acquired = tokio::time::timeout(Duration::from_secs(2), second.lock(1)).await;
        assert!(matches!(acquired, Ok(Ok(_))));
        assert!(dir.path().join("site-1.lock").exists());
    }

    #[tokio::test]
    async fn test_unwritable_lock_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"").unwrap();

        let locks = SiteLocks::shared(blocker.join("locks"));
        assert!(matches!(locks.lock(1).await, Err(LockError::Open { .. })));
    }
}
