//! Registry of mounts served by `mntk` processes.
//!
//! Each serving process writes one JSON record into the state directory
//! while its mount is live and removes it after the mount is released.
//! Other invocations use the records to list, stop or clean up mounts.

use super::policy::AccessPolicy;
use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use uuid::Uuid;

/// A mount served by some process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRecord {
    /// Unique identifier for the mount
    pub id: Uuid,
    /// Process serving the mount
    pub pid: i32,
    /// Host path the filesystem is attached at
    pub mountpoint: PathBuf,
    /// Directory the filesystem exposes
    pub source: PathBuf,
    /// Access policy the mount was created with
    pub policy: AccessPolicy,
    /// When the mount became ready
    pub mounted_at: SystemTime,
}

impl MountRecord {
    /// Describes a mount served by the current process.
    pub fn new(mountpoint: PathBuf, source: PathBuf, policy: AccessPolicy) -> Self {
        Self {
            id: Uuid::new_v4(),
            pid: std::process::id() as i32,
            mountpoint,
            source,
            policy,
            mounted_at: SystemTime::now(),
        }
    }

    /// The serving process, if `pid` names a single process.
    ///
    /// `kill` treats 0 as the caller's process group and negative values as
    /// process groups or every process, so those never identify a server.
    pub fn serving_pid(&self) -> Option<Pid> {
        (self.pid > 0).then(|| Pid::from_raw(self.pid))
    }

    /// Whether the serving process still exists.
    pub fn is_alive(&self) -> bool {
        let Some(pid) = self.serving_pid() else {
            return false;
        };
        // Signal 0 only checks for existence; EPERM means it exists but
        // belongs to another user.
        match signal::kill(pid, None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

/// Stores [`MountRecord`]s as files in a state directory.
#[derive(Debug, Clone)]
pub struct Registry {
    dir: PathBuf,
}

impl Registry {
    /// Opens the registry at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// The state directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Stores `record`, replacing any record with the same id.
    pub fn register(&self, record: &MountRecord) -> Result<()> {
        let path = self.record_path(&record.id);
        fs::write(&path, serde_json::to_string_pretty(record)?)?;
        debug!("Registered mount {} at {:?}", record.id, path);
        Ok(())
    }

    /// Removes the record for `id`. Removing an unknown id is not an error.
    pub fn remove(&self, id: &Uuid) -> Result<()> {
        match fs::remove_file(self.record_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn read_record(path: &Path) -> Result<MountRecord> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Returns the record for `id`, if any. A record without a valid pid
    /// is an error.
    pub fn get(&self, id: &Uuid) -> Result<Option<MountRecord>> {
        let path = self.record_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let record = Self::read_record(&path)?;
        if record.serving_pid().is_none() {
            return Err(anyhow!("Mount record {} has invalid pid {}", id, record.pid));
        }
        Ok(Some(record))
    }

    // Every parseable record, including ones with an invalid pid.
    fn records(&self) -> Result<Vec<MountRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            match Self::read_record(&path) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable mount record {:?}: {}", path, e),
            }
        }
        records.sort_by_key(|r| r.mounted_at);
        Ok(records)
    }

    /// Lists every valid record, oldest first. Unreadable files and records
    /// without a valid pid are skipped.
    pub fn list(&self) -> Result<Vec<MountRecord>> {
        Ok(self
            .records()?
            .into_iter()
            .filter(|record| {
                let valid = record.serving_pid().is_some();
                if !valid {
                    warn!("Skipping mount record {} with invalid pid {}", record.id, record.pid);
                }
                valid
            })
            .collect())
    }

    /// Finds the record of the mount attached at `mountpoint`.
    pub fn find_by_mountpoint(&self, mountpoint: &Path) -> Result<Option<MountRecord>> {
        Ok(self
            .list()?
            .into_iter()
            .find(|record| record.mountpoint == mountpoint))
    }

    /// Asks the process serving `id` to release its mount.
    ///
    /// The record itself is removed by the serving process once the
    /// unmount finished.
    pub fn stop(&self, id: &Uuid) -> Result<MountRecord> {
        let record = self
            .get(id)?
            .ok_or_else(|| anyhow!("Mount not found: {}", id))?;
        let pid = record
            .serving_pid()
            .ok_or_else(|| anyhow!("Mount record {} has invalid pid {}", id, record.pid))?;
        signal::kill(pid, Signal::SIGTERM)?;
        info!("Sent SIGTERM to pid {} serving {}", record.pid, id);
        Ok(record)
    }

    /// Removes records whose serving process is gone, along with records
    /// that never named a valid process.
    pub fn purge_stale(&self) -> Result<usize> {
        let mut purged = 0;
        for record in self.records()? {
            if record.is_alive() {
                continue;
            }
            match self.remove(&record.id) {
                Ok(()) => purged += 1,
                Err(e) => error!("Failed to remove stale record {}: {}", record.id, e),
            }
        }
        if purged > 0 {
            info!("Purged {} stale mount records", purged);
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(mountpoint: &str) -> MountRecord {
        MountRecord::new(
            PathBuf::from(mountpoint),
            PathBuf::from("/srv/blocks"),
            AccessPolicy::AllowOther,
        )
    }

    #[test]
    fn test_register_and_get() -> Result<()> {
        let dir = tempdir()?;
        let registry = Registry::new(dir.path().join("mounts"))?;
        let rec = record("/mnt/a");

        registry.register(&rec)?;
        assert_eq!(registry.get(&rec.id)?, Some(rec.clone()));
        assert!(registry.get(&Uuid::new_v4())?.is_none());
        Ok(())
    }

    #[test]
    fn test_list_skips_garbage() -> Result<()> {
        let dir = tempdir()?;
        let registry = Registry::new(dir.path())?;
        registry.register(&record("/mnt/a"))?;
        registry.register(&record("/mnt/b"))?;
        fs::write(dir.path().join("broken.json"), "{not json")?;
        fs::write(dir.path().join("notes.txt"), "ignored")?;

        assert_eq!(registry.list()?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_remove_is_idempotent() -> Result<()> {
        let dir = tempdir()?;
        let registry = Registry::new(dir.path())?;
        let rec = record("/mnt/a");
        registry.register(&rec)?;

        registry.remove(&rec.id)?;
        registry.remove(&rec.id)?;
        assert!(registry.list()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_find_by_mountpoint() -> Result<()> {
        let dir = tempdir()?;
        let registry = Registry::new(dir.path())?;
        let rec = record("/mnt/a");
        registry.register(&rec)?;
        registry.register(&record("/mnt/b"))?;

        let found = registry.find_by_mountpoint(Path::new("/mnt/a"))?;
        assert_eq!(found.map(|r| r.id), Some(rec.id));
        assert!(registry.find_by_mountpoint(Path::new("/mnt/c"))?.is_none());
        Ok(())
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(record("/mnt/a").is_alive());
    }

    #[test]
    fn test_purge_removes_dead_processes() -> Result<()> {
        let dir = tempdir()?;
        let registry = Registry::new(dir.path())?;
        let live = record("/mnt/live");
        let mut dead = record("/mnt/dead");
        // Beyond the kernel's pid limit, so no such process exists.
        dead.pid = i32::MAX;
        registry.register(&live)?;
        registry.register(&dead)?;

        assert_eq!(registry.purge_stale()?, 1);
        let remaining: Vec<_> = registry.list()?.into_iter().map(|r| r.id).collect();
        assert_eq!(remaining, vec![live.id]);
        Ok(())
    }

    #[test]
    fn test_group_pids_are_rejected() -> Result<()> {
        let dir = tempdir()?;
        let registry = Registry::new(dir.path())?;
        let live = record("/mnt/live");
        registry.register(&live)?;

        for pid in [0, -1] {
            let mut bad = record("/mnt/bad");
            bad.pid = pid;
            registry.register(&bad)?;

            assert!(bad.serving_pid().is_none());
            assert!(!bad.is_alive());
            assert!(registry.get(&bad.id).is_err());
            assert!(registry.stop(&bad.id).is_err());
        }

        let listed: Vec<_> = registry.list()?.into_iter().map(|r| r.id).collect();
        assert_eq!(listed, vec![live.id]);
        assert_eq!(registry.purge_stale()?, 2);
        assert_eq!(fs::read_dir(dir.path())?.count(), 1);
        Ok(())
    }

    #[test]
    fn test_stop_unknown_mount_fails() -> Result<()> {
        let dir = tempdir()?;
        let registry = Registry::new(dir.path())?;
        assert!(registry.stop(&Uuid::new_v4()).is_err());
        Ok(())
    }

    #[test]
    fn test_record_json_shape() -> Result<()> {
        let rec = record("/mnt/a");
        let value: serde_json::Value = serde_json::to_value(&rec)?;
        assert_eq!(value["policy"], "other");
        assert_eq!(value["mountpoint"], "/mnt/a");
        Ok(())
    }
}
