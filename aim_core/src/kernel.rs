//! Kernel-resident permission mirror.
//!
//! When the node exists the daemon copies its elevation and drop writes
//! into it and compares CHECK answers. The daemon's own answer is always
//! the one returned to clients.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::capability::CapabilitySet;
use crate::error::{AimError, Result};

/// Fixed-layout argument shared by every mirror call.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KaimRequest {
    pub pid: i32,
    pub flags: u32,
    pub duration: u32,
    pub result: i32,
}

impl KaimRequest {
    pub fn new(pid: i32, flags: CapabilitySet) -> Self {
        Self {
            pid,
            flags: flags.bits(),
            ..Self::default()
        }
    }
}

/// ioctl wrappers for the mirror node (magic `'A'`).
pub mod ioctl {
    use super::KaimRequest;

    pub const KAIM_MAGIC: u8 = b'A';
    pub const KAIM_ELEVATE: u8 = 1;
    pub const KAIM_STATUS: u8 = 2;
    pub const KAIM_OPEN: u8 = 3;
    pub const KAIM_CHECK: u8 = 4;
    pub const KAIM_DROP: u8 = 5;
    pub const KAIM_AUDIT: u8 = 6;
    /// Declared by the kernel side but never implemented there; not issued.
    pub const KAIM_SESSION: u8 = 7;

    nix::ioctl_readwrite!(kaim_elevate, KAIM_MAGIC, KAIM_ELEVATE, KaimRequest);
    nix::ioctl_readwrite!(kaim_status, KAIM_MAGIC, KAIM_STATUS, KaimRequest);
    nix::ioctl_readwrite!(kaim_open, KAIM_MAGIC, KAIM_OPEN, KaimRequest);
    nix::ioctl_readwrite!(kaim_check, KAIM_MAGIC, KAIM_CHECK, KaimRequest);
    nix::ioctl_readwrite!(kaim_drop, KAIM_MAGIC, KAIM_DROP, KaimRequest);
    nix::ioctl_readwrite!(kaim_audit, KAIM_MAGIC, KAIM_AUDIT, KaimRequest);
}

/// Calls the daemon makes into the kernel mirror.
pub trait KernelMirror: Send + Sync + fmt::Debug {
    fn elevate(&self, pid: i32, grant: CapabilitySet, duration_secs: u32) -> Result<()>;

    fn drop_cap(&self, pid: i32, caps: CapabilitySet) -> Result<()>;

    /// The mirror's answer to "does `pid` hold `required`".
    fn check(&self, pid: i32, required: CapabilitySet) -> Result<bool>;

    /// Effective capabilities the mirror holds for `pid`.
    fn status(&self, pid: i32) -> Result<CapabilitySet>;
}

/// Mirror reached through ioctls on a character device.
#[derive(Debug)]
pub struct IoctlMirror {
    path: PathBuf,
    file: File,
}

type IoctlFn = unsafe fn(nix::libc::c_int, *mut KaimRequest) -> nix::Result<nix::libc::c_int>;

impl IoctlMirror {
    /// Open the mirror node. A missing node is `Ok(None)`: the daemon is
    /// then authoritative on its own.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Option<Self>> {
        let path = path.as_ref();
        match OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(nix::libc::O_CLOEXEC)
            .open(path)
        {
            Ok(file) => {
                info!("Kernel mirror attached at {}", path.display());
                Ok(Some(Self {
                    path: path.to_path_buf(),
                    file,
                }))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("No kernel mirror at {}", path.display());
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn call(&self, name: &str, op: IoctlFn, mut request: KaimRequest) -> Result<KaimRequest> {
        // SAFETY: the fd is owned by self and stays open for the call;
        // `request` is a live repr(C) value matching the ioctl's argument type.
        unsafe { op(self.file.as_raw_fd(), &mut request) }.map_err(|errno| {
            AimError::Internal(format!("kernel mirror {} failed: {}", name, errno))
        })?;
        Ok(request)
    }
}

impl KernelMirror for IoctlMirror {
    fn elevate(&self, pid: i32, grant: CapabilitySet, duration_secs: u32) -> Result<()> {
        let mut request = KaimRequest::new(pid, grant);
        request.duration = duration_secs;
        self.call("elevate", ioctl::kaim_elevate, request).map(|_| ())
    }

    fn drop_cap(&self, pid: i32, caps: CapabilitySet) -> Result<()> {
        self.call("drop", ioctl::kaim_drop, KaimRequest::new(pid, caps))
            .map(|_| ())
    }

    fn check(&self, pid: i32, required: CapabilitySet) -> Result<bool> {
        let reply = self.call("check", ioctl::kaim_check, KaimRequest::new(pid, required))?;
        Ok(reply.result != 0)
    }

    fn status(&self, pid: i32) -> Result<CapabilitySet> {
        let reply = self.call(
            "status",
            ioctl::kaim_status,
            KaimRequest::new(pid, CapabilitySet::empty()),
        )?;
        Ok(CapabilitySet::from_bits_truncate(reply.flags))
    }
}
