//! Advisory lock on the cache directory
//!
//! One imgdeps process builds against a cache directory at a time. The lock
//! file records the owner's pid, host and acquisition time. A lock whose
//! owner is gone, or that is older than the staleness threshold, is
//! reported as [`ImgdepsError::StaleLock`] and only removed when the
//! operator passes `--break-lock`. Pids are only checked for locks taken
//! on this host; a lock from another host is held until it ages out.

use crate::error::{ImgdepsError, ImgdepsResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Lock file name inside the cache directory
pub const LOCK_FILE: &str = "imgdeps.lock";

/// Contents of the lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub host: String,
    pub acquired_at: DateTime<Utc>,
}

/// Held lock; removed on drop
#[derive(Debug)]
pub struct CacheLock {
    path: PathBuf,
}

impl CacheLock {
    pub fn path_in(cache_dir: &Path) -> PathBuf {
        cache_dir.join(LOCK_FILE)
    }

    /// Acquire the lock for `cache_dir`
    pub async fn acquire(
        cache_dir: &Path,
        stale_after: Duration,
        break_lock: bool,
    ) -> ImgdepsResult<Self> {
        fs::create_dir_all(cache_dir)
            .await
            .map_err(|e| ImgdepsError::io(format!("creating {}", cache_dir.display()), e))?;
        let path = Self::path_in(cache_dir);

        if Self::try_create(&path).await? {
            return Ok(Self { path });
        }

        let existing = read_info(&path).await;
        if break_lock {
            warn!(
                "Breaking cache lock at {} (held by pid {})",
                path.display(),
                existing.as_ref().map(|i| i.pid).unwrap_or(0)
            );
            fs::remove_file(&path)
                .await
                .map_err(|e| ImgdepsError::io(format!("removing {}", path.display()), e))?;
            if Self::try_create(&path).await? {
                return Ok(Self { path });
            }
            let info = read_info(&path).await;
            return Err(ImgdepsError::CacheLocked {
                pid: info.as_ref().map(|i| i.pid).unwrap_or(0),
                since: info.map(|i| i.acquired_at.to_rfc3339()).unwrap_or_default(),
            });
        }

        match existing {
            Some(info) => {
                let age = Utc::now().signed_duration_since(info.acquired_at);
                let local = info.host == host_name();
                if !local {
                    debug!("Cache lock {} is held from host {}", path.display(), info.host);
                }
                if age > stale_after || (local && !pid_alive(info.pid)) {
                    Err(ImgdepsError::StaleLock {
                        path,
                        pid: info.pid,
                        age_secs: age.num_seconds(),
                    })
                } else {
                    Err(ImgdepsError::CacheLocked {
                        pid: info.pid,
                        since: info.acquired_at.to_rfc3339(),
                    })
                }
            }
            None => {
                let written = modified_at(&path).await;
                let age = written.map(|at| Utc::now().signed_duration_since(at));
                // An empty young file belongs to an owner that has not written it yet
                if is_empty(&path).await && age.is_none_or(|age| age <= stale_after) {
                    return Err(ImgdepsError::CacheLocked {
                        pid: 0,
                        since: written.map(|at| at.to_rfc3339()).unwrap_or_default(),
                    });
                }
                // Unreadable lock file: nobody can prove ownership
                Err(ImgdepsError::StaleLock {
                    path,
                    pid: 0,
                    age_secs: age.map(|age| age.num_seconds()).unwrap_or(0),
                })
            }
        }
    }

    async fn try_create(path: &Path) -> ImgdepsResult<bool> {
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await;
        let mut file = match file {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => {
                return Err(ImgdepsError::io(format!("creating {}", path.display()), e));
            }
        };

        let info = LockInfo {
            pid: std::process::id(),
            host: host_name(),
            acquired_at: Utc::now(),
        };
        let content = serde_json::to_string(&info)?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| ImgdepsError::io(format!("writing {}", path.display()), e))?;
        file.flush()
            .await
            .map_err(|e| ImgdepsError::io(format!("writing {}", path.display()), e))?;
        debug!("Acquired cache lock {}", path.display());
        Ok(true)
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove cache lock {}: {}", self.path.display(), e);
            }
        }
    }
}

async fn read_info(path: &Path) -> Option<LockInfo> {
    let content = fs::read_to_string(path).await.ok()?;
    serde_json::from_str(&content).ok()
}

async fn is_empty(path: &Path) -> bool {
    fs::metadata(path).await.is_ok_and(|meta| meta.len() == 0)
}

async fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    let modified = fs::metadata(path).await.ok()?.modified().ok()?;
    Some(modified.into())
}

/// Name of this host as recorded in lock files
#[cfg(unix)]
fn host_name() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer is valid for writes of its full length
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc == 0 {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        if let Ok(name) = std::str::from_utf8(&buf[..end]) {
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(not(unix))]
fn host_name() -> String {
    std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Whether a process with `pid` exists on this host
#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// A pid no process can have
    const DEAD_PID: u32 = i32::MAX as u32;

    fn write_lock(dir: &Path, pid: u32, host: &str, age: Duration) {
        let info = LockInfo {
            pid,
            host: host.to_string(),
            acquired_at: Utc::now() - age,
        };
        std::fs::write(
            CacheLock::path_in(dir),
            serde_json::to_string(&info).unwrap(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn second_acquire_reports_locked() {
        let temp = TempDir::new().unwrap();
        let lock = CacheLock::acquire(temp.path(), Duration::hours(1), false)
            .await
            .unwrap();
        let err = CacheLock::acquire(temp.path(), Duration::hours(1), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ImgdepsError::CacheLocked { pid, .. } if pid == std::process::id()));
        drop(lock);
        assert!(!CacheLock::path_in(temp.path()).exists());
    }

    #[tokio::test]
    async fn old_lock_is_stale_and_not_broken_silently() {
        let temp = TempDir::new().unwrap();
        write_lock(temp.path(), std::process::id(), &host_name(), Duration::hours(5));

        let err = CacheLock::acquire(temp.path(), Duration::hours(1), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ImgdepsError::StaleLock { .. }));
        assert!(err.hint().is_some());
        assert!(CacheLock::path_in(temp.path()).exists());
    }

    #[tokio::test]
    async fn break_lock_takes_over() {
        let temp = TempDir::new().unwrap();
        write_lock(temp.path(), std::process::id(), &host_name(), Duration::hours(5));

        let lock = CacheLock::acquire(temp.path(), Duration::hours(1), true)
            .await
            .unwrap();
        let content = std::fs::read_to_string(CacheLock::path_in(temp.path())).unwrap();
        let info: LockInfo = serde_json::from_str(&content).unwrap();
        assert!(Utc::now().signed_duration_since(info.acquired_at) < Duration::minutes(1));
        assert_eq!(info.host, host_name());
        drop(lock);
        assert!(!CacheLock::path_in(temp.path()).exists());
    }

    #[tokio::test]
    async fn dead_owner_on_this_host_is_stale() {
        let temp = TempDir::new().unwrap();
        write_lock(temp.path(), DEAD_PID, &host_name(), Duration::minutes(1));
        let err = CacheLock::acquire(temp.path(), Duration::hours(1), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ImgdepsError::StaleLock { pid: DEAD_PID, .. }));
    }

    #[tokio::test]
    async fn lock_from_another_host_is_held_until_it_ages_out() {
        let temp = TempDir::new().unwrap();
        let elsewhere = format!("{}-elsewhere", host_name());
        write_lock(temp.path(), DEAD_PID, &elsewhere, Duration::minutes(1));
        let err = CacheLock::acquire(temp.path(), Duration::hours(1), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ImgdepsError::CacheLocked { pid: DEAD_PID, .. }));

        write_lock(temp.path(), DEAD_PID, &elsewhere, Duration::hours(5));
        let err = CacheLock::acquire(temp.path(), Duration::hours(1), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ImgdepsError::StaleLock { .. }));
    }

    #[tokio::test]
    async fn empty_lock_file_is_held_until_stale() {
        let temp = TempDir::new().unwrap();
        let path = CacheLock::path_in(temp.path());
        std::fs::write(&path, "").unwrap();
        let err = CacheLock::acquire(temp.path(), Duration::hours(1), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ImgdepsError::CacheLocked { pid: 0, .. }));

        let two_hours_ago = std::time::SystemTime::now() - std::time::Duration::from_secs(7200);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(two_hours_ago)
            .unwrap();
        let err = CacheLock::acquire(temp.path(), Duration::hours(1), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ImgdepsError::StaleLock { pid: 0, .. }));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn garbage_lock_file_is_stale() {
        let temp = TempDir::new().unwrap();
        std::fs::write(CacheLock::path_in(temp.path()), "???").unwrap();
        let err = CacheLock::acquire(temp.path(), Duration::hours(1), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ImgdepsError::StaleLock { pid: 0, .. }));
    }

    #[cfg(unix)]
    #[test]
    fn current_process_is_alive() {
        assert!(pid_alive(std::process::id()));
        assert!(!pid_alive(0));
    }
}
