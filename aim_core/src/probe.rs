//! Process identity and liveness probes.
//!
//! The daemon never trusts a client's word about who a pid belongs to; it
//! asks the kernel through a [`ProcessProbe`].

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::trace;

use crate::principal::Identity;

/// Source of kernel-visible process facts.
pub trait ProcessProbe: Send + Sync + fmt::Debug {
    /// Real uid, gid and program name of `pid`, or `None` if it does not exist.
    fn identity(&self, pid: i32) -> Option<Identity>;

    /// Whether `pid` still refers to a running process.
    fn is_alive(&self, pid: i32) -> bool;
}

/// Probe backed by procfs and signal 0.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl ProcFs {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Read process facts from an alternate procfs mount.
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// First (real) id on a `Uid:`/`Gid:` line of `/proc/<pid>/status`.
    fn real_id(status: &str, key: &str) -> Option<u32> {
        status
            .lines()
            .find_map(|line| line.strip_prefix(key))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|id| id.parse().ok())
    }
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProbe for ProcFs {
    fn identity(&self, pid: i32) -> Option<Identity> {
        if pid <= 0 {
            return None;
        }
        let dir = self.root.join(pid.to_string());
        let status = fs::read_to_string(dir.join("status")).ok()?;
        let uid = Self::real_id(&status, "Uid:")?;
        let gid = Self::real_id(&status, "Gid:")?;
        let program = fs::read_to_string(dir.join("comm"))
            .map(|comm| comm.trim_end().to_string())
            .unwrap_or_default();
        trace!(pid, uid, gid, program = %program, "Probed process identity");
        Some(Identity::new(uid, gid, program))
    }

    fn is_alive(&self, pid: i32) -> bool {
        // pid 0 and negatives address process groups
        if pid <= 0 {
            return false;
        }
        match kill(Pid::from_raw(pid), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

/// Probe over a fixed process table, for embedding and tests.
#[derive(Debug, Default)]
pub struct InMemoryProbe {
    processes: DashMap<i32, Identity>,
}

impl InMemoryProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `pid` exist with `identity`.
    pub fn spawn(&self, pid: i32, identity: Identity) {
        self.processes.insert(pid, identity);
    }

    /// Make `pid` disappear.
    pub fn kill(&self, pid: i32) {
        self.processes.remove(&pid);
    }
}

impl ProcessProbe for InMemoryProbe {
    fn identity(&self, pid: i32) -> Option<Identity> {
        self.processes.get(&pid).map(|entry| entry.value().clone())
    }

    fn is_alive(&self, pid: i32) -> bool {
        self.processes.contains_key(&pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_ids() {
        let status = "Name:\tbash\nUid:\t1000\t1001\t1002\t1003\nGid:\t100\t100\t100\t100\n";
        assert_eq!(ProcFs::real_id(status, "Uid:"), Some(1000));
        assert_eq!(ProcFs::real_id(status, "Gid:"), Some(100));
        assert_eq!(ProcFs::real_id(status, "Groups:"), None);
    }

    #[test]
    fn test_procfs_fake_root() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("4321");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("status"), "Uid:\t1000\t0\t0\t0\nGid:\t1000\t0\t0\t0\n").unwrap();
        fs::write(dir.join("comm"), "worker\n").unwrap();

        let probe = ProcFs::with_root(root.path());
        assert_eq!(probe.identity(4321), Some(Identity::new(1000, 1000, "worker")));
        assert_eq!(probe.identity(4322), None);
        assert_eq!(probe.identity(0), None);
    }

    #[test]
    fn test_own_process_is_alive() {
        let probe = ProcFs::new();
        assert!(probe.is_alive(std::process::id() as i32));
        assert!(!probe.is_alive(0));
        assert!(!probe.is_alive(-1));
    }

    #[test]
    fn test_in_memory_probe() {
        let probe = InMemoryProbe::new();
        probe.spawn(10, Identity::new(0, 0, "init"));
        assert!(probe.is_alive(10));
        probe.kill(10);
        assert!(!probe.is_alive(10));
        assert!(probe.identity(10).is_none());
    }
}
