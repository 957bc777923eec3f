//! Duplicate-instance protection
//!
//! Each frontend claims `{runtime_dir}/{equipment}.lock` at startup. The lock
//! file records the owning pid; a lock whose pid is no longer alive is stale
//! and gets replaced. The returned [`InstanceLock`] removes the file on drop.

use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, warn};

/// Contents of a lock file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Owning process id
    pub pid: u32,
    /// When the owner started
    pub started: DateTime<Utc>,
    /// Equipment name the lock belongs to
    pub equipment: String,
}

/// Directory of per-equipment lock files
#[derive(Debug, Clone)]
pub struct InstanceRegistry {
    dir: PathBuf,
}

impl InstanceRegistry {
    /// Registry rooted at `dir` (created on first acquire)
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Lock file path for `equipment`
    pub fn lock_path(&self, equipment: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", equipment))
    }

    /// Acquire `equipment` for this process
    pub fn acquire(&self, equipment: &str) -> AppResult<InstanceLock> {
        self.acquire_as(equipment, std::process::id())
    }

    /// Acquire `equipment` on behalf of `pid`
    pub fn acquire_as(&self, equipment: &str, pid: u32) -> AppResult<InstanceLock> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.lock_path(equipment);

        if let Some(existing) = read_record(&path) {
            if existing.pid != pid && process_alive(existing.pid) {
                return Err(DaqError::DuplicateInstance(equipment.to_string()));
            }
            warn!(
                equipment,
                stale_pid = existing.pid,
                "replacing stale instance lock"
            );
            std::fs::remove_file(&path)?;
        }

        let record = LockRecord {
            pid,
            started: Utc::now(),
            equipment: equipment.to_string(),
        };
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(DaqError::DuplicateInstance(equipment.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(serde_json::to_string(&record)?.as_bytes())?;
        debug!(equipment, path = %path.display(), "instance lock acquired");

        Ok(InstanceLock { path, record })
    }

    /// Whether a live process currently holds `equipment`
    pub fn is_running(&self, equipment: &str) -> bool {
        read_record(&self.lock_path(equipment))
            .map(|r| process_alive(r.pid))
            .unwrap_or(false)
    }
}

/// Held instance lock; the lock file is removed when this is dropped
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    record: LockRecord,
}

impl InstanceLock {
    /// Lock file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Recorded owner
    pub fn record(&self) -> &LockRecord {
        &self.record
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // only remove the file if it is still ours
        if read_record(&self.path).is_some_and(|r| r.pid == self.record.pid) {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "failed to remove instance lock");
            }
        }
    }
}

fn read_record(path: &Path) -> Option<LockRecord> {
    let text = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&text) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable instance lock");
            None
        }
    }
}

fn process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some()
}
