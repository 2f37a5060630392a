//! Single-writer process lock.
//!
//! One lock file per process name under the locks directory guarantees at
//! most one writer with that name per host. The file carries owner metadata
//! so an operator staring at a busy lock can see who holds it and since when.
//!
//! Stale detection: a lock whose recorded pid is no longer alive is reclaimed
//! automatically. A lock whose pid is alive is always respected, even if the
//! metadata looks odd.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

/// Owner metadata written into the lock file at acquisition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockOwner {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub temp_dir: PathBuf,
    /// Process role, e.g. `daemon`, `planet`, `boundaries`.
    pub role: String,
    /// Transition notes appended when the lock is handed between phases.
    #[serde(default)]
    pub handoff: Vec<String>,
}

/// A held process lock. Released explicitly or best-effort on drop.
#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
    owner: LockOwner,
    released: bool,
}

/// Whether a pid refers to a live process.
///
/// `kill(pid, 0)` succeeds for live processes we can signal and fails with
/// EPERM for live processes we cannot; only ESRCH means gone.
fn pid_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs only the permission check, no signal is sent.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

impl ProcessLock {
    /// Acquire the lock for `role` at `path`, writing owner metadata.
    ///
    /// A present lock file with a live owner is
    /// [`IngestError::WriterContention`]; a stale one (dead pid) is reclaimed.
    pub fn acquire(path: &Path, role: &str, temp_dir: &Path) -> Result<Self, IngestError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        loop {
            match fs::OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut f) => {
                    let owner = LockOwner {
                        pid: std::process::id(),
                        started_at: Utc::now(),
                        temp_dir: temp_dir.to_path_buf(),
                        role: role.to_string(),
                        handoff: Vec::new(),
                    };
                    let body = serde_json::to_string_pretty(&owner).map_err(|e| {
                        IngestError::Internal(format!("lock metadata serialization: {e}"))
                    })?;
                    f.write_all(body.as_bytes())?;
                    f.sync_all()?;
                    return Ok(ProcessLock {
                        path: path.to_path_buf(),
                        owner,
                        released: false,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    match Self::read_owner(path) {
                        Ok(existing) if pid_alive(existing.pid) => {
                            return Err(IngestError::WriterContention(format!(
                                "{role} lock held by pid {} ({}) since {}",
                                existing.pid, existing.role, existing.started_at
                            )));
                        }
                        Ok(existing) => {
                            tracing::warn!(
                                "reclaiming stale lock {} (pid {} is gone)",
                                path.display(),
                                existing.pid
                            );
                            fs::remove_file(path)?;
                        }
                        Err(_) => {
                            // Unreadable metadata: cannot prove the owner is
                            // alive, but cannot disprove it either. Refuse.
                            return Err(IngestError::WriterContention(format!(
                                "{role} lock {} exists with unreadable owner metadata",
                                path.display()
                            )));
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Read owner metadata from an existing lock file.
    pub fn read_owner(path: &Path) -> Result<LockOwner, IngestError> {
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| IngestError::Internal(format!("corrupt lock file {}: {e}", path.display())))
    }

    /// Record a phase transition in the lock file, e.g. before an in-process
    /// long operation starts under the same lock scope.
    pub fn record_handoff(&mut self, note: &str) -> Result<(), IngestError> {
        self.owner
            .handoff
            .push(format!("{} {note}", Utc::now().to_rfc3339()));
        let body = serde_json::to_string_pretty(&self.owner)
            .map_err(|e| IngestError::Internal(format!("lock metadata serialization: {e}")))?;
        fs::write(&self.path, body)?;
        Ok(())
    }

    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    /// Release the lock, removing the file.
    pub fn release(mut self) -> Result<(), IngestError> {
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.lock");
        let lock = ProcessLock::acquire(&path, "daemon", dir.path()).unwrap();
        assert!(path.exists());
        assert_eq!(lock.owner().pid, std::process::id());
        lock.release().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_live_owner_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.lock");
        let _held = ProcessLock::acquire(&path, "daemon", dir.path()).unwrap();

        // Second acquisition from this same (live) pid must be refused.
        let err = ProcessLock::acquire(&path, "daemon", dir.path()).unwrap_err();
        assert!(matches!(err, IngestError::WriterContention(_)));
        assert_eq!(err.exit_code(), 246);
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.lock");

        // Fabricate a lock owned by a pid that cannot be alive: far above
        // any kernel pid_max, but still positive as a pid_t.
        let dead = LockOwner {
            pid: 999_999_999,
            started_at: Utc::now(),
            temp_dir: dir.path().to_path_buf(),
            role: "daemon".into(),
            handoff: Vec::new(),
        };
        fs::write(&path, serde_json::to_string(&dead).unwrap()).unwrap();

        let lock = ProcessLock::acquire(&path, "daemon", dir.path()).unwrap();
        assert_eq!(lock.owner().pid, std::process::id());
    }

    #[test]
    fn test_unreadable_metadata_refuses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.lock");
        fs::write(&path, b"not json").unwrap();

        let err = ProcessLock::acquire(&path, "daemon", dir.path()).unwrap_err();
        assert!(matches!(err, IngestError::WriterContention(_)));
        // The file must be untouched.
        assert_eq!(fs::read(&path).unwrap(), b"not json");
    }

    #[test]
    fn test_handoff_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("planet.lock");
        let mut lock = ProcessLock::acquire(&path, "planet", dir.path()).unwrap();
        lock.record_handoff("planet load starting").unwrap();

        let owner = ProcessLock::read_owner(&path).unwrap();
        assert_eq!(owner.handoff.len(), 1);
        assert!(owner.handoff[0].ends_with("planet load starting"));
    }

    #[test]
    fn test_drop_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.lock");
        {
            let _lock = ProcessLock::acquire(&path, "daemon", dir.path()).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
