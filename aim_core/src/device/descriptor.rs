use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;

use crate::capability::CapabilitySet;
use crate::error::AimError;
use crate::principal::Identity;

/// Longest accepted device name, in bytes.
pub const MAX_DEVICE_NAME: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Safe,
    Tty,
    Restricted,
    Misc,
}

impl DeviceClass {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceClass::Safe => "safe",
            DeviceClass::Tty => "tty",
            DeviceClass::Restricted => "restricted",
            DeviceClass::Misc => "misc",
        }
    }

    /// Capability needed to open a device of this class unless overridden.
    pub fn default_required(self) -> CapabilitySet {
        match self {
            DeviceClass::Restricted => CapabilitySet::DEV | CapabilitySet::SEC,
            _ => CapabilitySet::DEV,
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a client wants to open a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessMode::Read => "r",
            AccessMode::Write => "w",
            AccessMode::ReadWrite => "rw",
        }
    }

    pub fn reads(self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::ReadWrite)
    }

    pub fn writes(self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::ReadWrite)
    }
}

impl FromStr for AccessMode {
    type Err = AimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "r" => Ok(AccessMode::Read),
            "w" => Ok(AccessMode::Write),
            "rw" | "wr" => Ok(AccessMode::ReadWrite),
            other => Err(AimError::InvalidOperation(format!(
                "invalid access mode: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A device the daemon mediates access to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub name: String,
    pub path: PathBuf,
    pub major: u32,
    pub minor: u32,
    pub class: DeviceClass,
    pub required_cap: CapabilitySet,
    pub owner_uid: u32,
    pub owner_gid: u32,
    /// Unix-style permission bits (low nine bits used).
    pub mode: u32,
}

impl DeviceDescriptor {
    /// Descriptor for `/dev/<name>` owned by root with class defaults.
    pub fn new(name: impl Into<String>, major: u32, minor: u32, class: DeviceClass) -> Self {
        let name = name.into();
        Self {
            path: PathBuf::from("/dev").join(&name),
            name,
            major,
            minor,
            class,
            required_cap: class.default_required(),
            owner_uid: 0,
            owner_gid: 0,
            mode: 0o666,
        }
    }

    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.path = path.as_ref().to_path_buf();
        self
    }

    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.owner_uid = uid;
        self.owner_gid = gid;
        self
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode & 0o777;
        self
    }

    pub fn with_required(mut self, required: CapabilitySet) -> Self {
        self.required_cap = required;
        self
    }

    /// Check a device name: ASCII, non-empty, at most 63 bytes, no path separators.
    pub fn validate_name(name: &str) -> Result<(), String> {
        if name.is_empty() {
            return Err("device name cannot be empty".to_string());
        }
        if name.len() > MAX_DEVICE_NAME {
            return Err(format!(
                "device name longer than {} bytes: {}",
                MAX_DEVICE_NAME, name
            ));
        }
        if !name.is_ascii() || name.contains('/') || name.chars().any(|c| c.is_ascii_control()) {
            return Err(format!("device name must be plain ASCII: {:?}", name));
        }
        Ok(())
    }

    /// Permission bits that apply to `identity`: owner, group, or world.
    fn bits_for(&self, identity: &Identity) -> u32 {
        if identity.uid == self.owner_uid {
            (self.mode >> 6) & 0o7
        } else if identity.gid == self.owner_gid {
            (self.mode >> 3) & 0o7
        } else {
            self.mode & 0o7
        }
    }

    /// Unix-style permission-bit check for `mode`. uid 0 bypasses it.
    pub fn permits(&self, identity: &Identity, mode: AccessMode) -> bool {
        if identity.uid == 0 {
            return true;
        }
        let bits = self.bits_for(identity);
        (!mode.reads() || bits & 0o4 != 0) && (!mode.writes() || bits & 0o2 != 0)
    }

    /// Open the underlying node. The descriptor is always close-on-exec.
    pub async fn open(&self, mode: AccessMode) -> io::Result<File> {
        let file = OpenOptions::new()
            .read(mode.reads())
            .write(mode.writes())
            .custom_flags(nix::libc::O_CLOEXEC)
            .open(&self.path)
            .await?;
        Ok(file.into_std().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(mode: u32) -> DeviceDescriptor {
        DeviceDescriptor::new("ttyS0", 4, 64, DeviceClass::Tty)
            .with_owner(1000, 5)
            .with_mode(mode)
    }

    #[test]
    fn test_defaults_follow_class() {
        let null = DeviceDescriptor::new("null", 1, 3, DeviceClass::Safe);
        assert_eq!(null.path, PathBuf::from("/dev/null"));
        assert_eq!(null.required_cap, CapabilitySet::DEV);

        let mem = DeviceDescriptor::new("mem", 1, 1, DeviceClass::Restricted);
        assert_eq!(mem.required_cap, CapabilitySet::DEV | CapabilitySet::SEC);
    }

    #[test]
    fn test_access_mode_parse() {
        assert_eq!("r".parse::<AccessMode>().unwrap(), AccessMode::Read);
        assert_eq!("w".parse::<AccessMode>().unwrap(), AccessMode::Write);
        assert_eq!("rw".parse::<AccessMode>().unwrap(), AccessMode::ReadWrite);
        assert!("x".parse::<AccessMode>().is_err());
    }

    #[test]
    fn test_permission_classes() {
        let dev = device(0o640);
        let owner = Identity::new(1000, 1000, "owner");
        let group = Identity::new(2000, 5, "grouped");
        let world = Identity::new(3000, 3000, "other");

        assert!(dev.permits(&owner, AccessMode::ReadWrite));
        assert!(dev.permits(&group, AccessMode::Read));
        assert!(!dev.permits(&group, AccessMode::Write));
        assert!(!dev.permits(&group, AccessMode::ReadWrite));
        assert!(!dev.permits(&world, AccessMode::Read));
    }

    #[test]
    fn test_root_bypasses_bits() {
        let dev = device(0o000);
        assert!(dev.permits(&Identity::new(0, 0, "init"), AccessMode::ReadWrite));
    }

    #[test]
    fn test_validate_name() {
        assert!(DeviceDescriptor::validate_name("null").is_ok());
        assert!(DeviceDescriptor::validate_name("").is_err());
        assert!(DeviceDescriptor::validate_name(&"x".repeat(64)).is_err());
        assert!(DeviceDescriptor::validate_name(&"x".repeat(63)).is_ok());
        assert!(DeviceDescriptor::validate_name("../etc/shadow").is_err());
        assert!(DeviceDescriptor::validate_name("nül").is_err());
    }

    #[tokio::test]
    async fn test_open_sets_cloexec() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let dev = DeviceDescriptor::new("scratch", 0, 0, DeviceClass::Misc).with_path(file.path());
        let handle = dev.open(AccessMode::ReadWrite).await.unwrap();

        let flags = nix::fcntl::fcntl(
            std::os::unix::io::AsRawFd::as_raw_fd(&handle),
            nix::fcntl::FcntlArg::F_GETFD,
        )
        .unwrap();
        assert!(flags & nix::libc::FD_CLOEXEC != 0);
    }
}
