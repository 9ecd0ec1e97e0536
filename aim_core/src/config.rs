//! Daemon configuration.
//!
//! Loaded from a TOML file; every key has a default so an absent file
//! yields a working daemon.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::audit::DEFAULT_CAPACITY;
use crate::capability::CapabilitySet;
use crate::device::{DeviceClass, DeviceDescriptor, DeviceRegistry};
use crate::error::ConfigError;

/// Where `aim daemon` looks for its configuration by default.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/aim/aimd.toml";

/// Default control socket.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/aim.sock";

/// Largest audit ring; a full render of it still fits one frame.
pub const MAX_AUDIT_CAPACITY: usize = 2048;

/// Shortest and longest elevation, in seconds.
pub const MIN_ELEVATION_SECS: u64 = 1;
pub const MAX_ELEVATION_SECS: u64 = 3600;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Control socket path.
    pub socket_path: PathBuf,

    /// Permission bits applied to the socket.
    pub socket_mode: u32,

    /// Group the socket is handed to (best-effort).
    pub socket_group: String,

    /// Audit ring capacity.
    pub audit_capacity: usize,

    /// Maintenance sweep interval in milliseconds.
    pub sweep_interval_ms: u64,

    /// Grace period for in-flight sessions at shutdown, in milliseconds.
    pub shutdown_grace_ms: u64,

    /// Concurrent session limit.
    pub max_sessions: usize,

    /// uids `1..=system_uid_max` are system users.
    pub system_uid_max: u32,

    /// Elevation length when a request leaves it unspecified.
    pub default_elevation_secs: u64,

    /// Kernel fast-path node; ignored if it does not exist.
    pub kernel_device: Option<PathBuf>,

    /// Log filter, e.g. `info` or `aim_core=debug`.
    pub log_level: String,

    /// `text` or `json`.
    pub log_format: String,

    /// Devices added to (or overriding) the built-in table.
    #[serde(rename = "device")]
    pub devices: Vec<DeviceEntry>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            socket_mode: 0o660,
            socket_group: "aim".to_string(),
            audit_capacity: DEFAULT_CAPACITY,
            sweep_interval_ms: 1000,
            shutdown_grace_ms: 5000,
            max_sessions: 256,
            system_uid_max: 999,
            default_elevation_secs: 900,
            kernel_device: Some(PathBuf::from("/dev/kaim")),
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            devices: Vec::new(),
        }
    }
}

/// A `[[device]]` table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub name: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub major: u32,
    #[serde(default)]
    pub minor: u32,
    pub class: DeviceClass,
    /// Capability names; defaults to the class requirement.
    #[serde(default)]
    pub required: Option<Vec<String>>,
    #[serde(default)]
    pub owner_uid: u32,
    #[serde(default)]
    pub owner_gid: u32,
    #[serde(default = "default_device_mode")]
    pub mode: u32,
}

fn default_device_mode() -> u32 {
    0o666
}

impl TryFrom<&DeviceEntry> for DeviceDescriptor {
    type Error = ConfigError;

    fn try_from(entry: &DeviceEntry) -> Result<Self, Self::Error> {
        DeviceDescriptor::validate_name(&entry.name).map_err(ConfigError::InvalidDevice)?;

        let mut descriptor = DeviceDescriptor::new(&entry.name, entry.major, entry.minor, entry.class)
            .with_owner(entry.owner_uid, entry.owner_gid)
            .with_mode(entry.mode);
        if let Some(path) = &entry.path {
            descriptor = descriptor.with_path(path);
        }
        if let Some(names) = &entry.required {
            let required = CapabilitySet::parse(&names.join(",")).map_err(|e| {
                ConfigError::InvalidDevice(format!("{}: {}", entry.name, e))
            })?;
            descriptor = descriptor.with_required(required);
        }
        Ok(descriptor)
    }
}

impl DaemonConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: DaemonConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(text) => {
                info!("Loading configuration from {}", path.display());
                Self::from_toml(&text)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("No configuration at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_AUDIT_CAPACITY).contains(&self.audit_capacity) {
            return Err(ConfigError::InvalidValue(format!(
                "audit_capacity must be between 1 and {}",
                MAX_AUDIT_CAPACITY
            )));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "sweep_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::InvalidValue(
                "max_sessions must be at least 1".to_string(),
            ));
        }
        if !(MIN_ELEVATION_SECS..=MAX_ELEVATION_SECS).contains(&self.default_elevation_secs) {
            return Err(ConfigError::InvalidValue(format!(
                "default_elevation_secs must be within {}..={}",
                MIN_ELEVATION_SECS, MAX_ELEVATION_SECS
            )));
        }
        if !matches!(self.log_format.as_str(), "text" | "json") {
            return Err(ConfigError::InvalidValue(format!(
                "log_format must be text or json, got {}",
                self.log_format
            )));
        }
        for entry in &self.devices {
            DeviceDescriptor::try_from(entry)?;
        }
        Ok(())
    }

    /// Built-in devices overlaid with the configured ones.
    pub fn device_registry(&self) -> Result<DeviceRegistry, ConfigError> {
        let mut registry = DeviceRegistry::builtin();
        for entry in &self.devices {
            registry.insert(DeviceDescriptor::try_from(entry)?);
        }
        Ok(registry)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
