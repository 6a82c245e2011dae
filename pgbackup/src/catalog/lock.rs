//! Single-writer lock per instance.
//!
//! The lock is a file created with `O_EXCL` in the instance directory,
//! holding a JSON description of the holder. A lock whose process no
//! longer exists on this host is taken over.

use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

pub const LOCK_FILE: &str = "pgbackup.lock";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub holder_id: Uuid,
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
    /// Operation holding the lock (e.g. "backup", "delete").
    pub operation: String,
}

impl LockInfo {
    fn current(operation: &str) -> Self {
        Self {
            holder_id: Uuid::new_v4(),
            pid: std::process::id(),
            hostname: local_hostname(),
            acquired_at: Utc::now(),
            operation: operation.to_string(),
        }
    }

    /// False only when the holder is known to be gone.
    fn holder_alive(&self) -> bool {
        if self.hostname != local_hostname() {
            return true;
        }
        process_exists(self.pid)
    }
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(unix)]
pub(crate) fn process_exists(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}

#[cfg(not(unix))]
pub(crate) fn process_exists(_pid: u32) -> bool {
    true
}

/// Held lock; released on drop.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    info: LockInfo,
}

impl InstanceLock {
    pub fn acquire(instance_dir: &Path, instance: &str, operation: &str) -> Result<Self> {
        let path = instance_dir.join(LOCK_FILE);
        let info = LockInfo::current(operation);
        let payload = serde_json::to_vec_pretty(&info)?;

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(&payload)
                        .and_then(|_| file.sync_all())
                        .map_err(|e| EngineError::file("write", &path, e))?;
                    debug!("Acquired lock on instance '{}' for {}", instance, operation);
                    return Ok(Self { path, info });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = std::fs::read(&path)
                        .ok()
                        .and_then(|raw| serde_json::from_slice::<LockInfo>(&raw).ok());
                    match holder {
                        Some(holder) if holder.holder_alive() => {
                            return Err(EngineError::Locked(format!(
                                "Instance '{}' is locked by process {} ({} since {})",
                                instance,
                                holder.pid,
                                holder.operation,
                                holder.acquired_at.format("%Y-%m-%d %H:%M:%S")
                            )));
                        }
                        Some(holder) => warn!(
                            "Taking over stale lock of instance '{}' left by process {}",
                            instance, holder.pid
                        ),
                        None => warn!("Removing unreadable lock file \"{}\"", path.display()),
                    }
                    match std::fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(EngineError::file("remove", &path, e)),
                    }
                }
                Err(e) => return Err(EngineError::file("create", &path, e)),
            }
        }

        Err(EngineError::Locked(format!(
            "Instance '{}' is locked by a concurrent process",
            instance
        )))
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let still_ours = std::fs::read(&self.path)
            .ok()
            .and_then(|raw| serde_json::from_slice::<LockInfo>(&raw).ok())
            .is_some_and(|holder| holder.holder_id == self.info.holder_id);
        if still_ours {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("Cannot remove lock file \"{}\": {}", self.path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_holder_is_rejected() {
        let dir = TempDir::new().unwrap();
        let lock = InstanceLock::acquire(dir.path(), "node", "backup").unwrap();
        assert_eq!(lock.info().pid, std::process::id());

        let err = InstanceLock::acquire(dir.path(), "node", "delete").unwrap_err();
        assert!(matches!(err, EngineError::Locked(_)));
        assert!(err.to_string().contains("is locked by process"));

        drop(lock);
        assert!(!dir.path().join(LOCK_FILE).exists());
        InstanceLock::acquire(dir.path(), "node", "delete").unwrap();
    }

    #[test]
    fn test_stale_lock_is_taken_over() {
        let dir = TempDir::new().unwrap();
        let stale = LockInfo {
            holder_id: Uuid::new_v4(),
            pid: 0x3FFF_FFF0,
            hostname: local_hostname(),
            acquired_at: Utc::now(),
            operation: "backup".into(),
        };
        std::fs::write(dir.path().join(LOCK_FILE), serde_json::to_vec(&stale).unwrap()).unwrap();

        let lock = InstanceLock::acquire(dir.path(), "node", "backup").unwrap();
        assert_ne!(lock.info().holder_id, stale.holder_id);
    }

    #[test]
    fn test_foreign_host_lock_is_respected() {
        let dir = TempDir::new().unwrap();
        let remote = LockInfo {
            holder_id: Uuid::new_v4(),
            pid: 1,
            hostname: format!("{}-elsewhere", local_hostname()),
            acquired_at: Utc::now(),
            operation: "merge".into(),
        };
        std::fs::write(dir.path().join(LOCK_FILE), serde_json::to_vec(&remote).unwrap()).unwrap();
        assert!(InstanceLock::acquire(dir.path(), "node", "backup").is_err());
    }
}
