use std::collections::BTreeMap;
use std::fmt;

use tokio::fs::OpenOptions;

use super::descriptor::{AccessMode, DeviceClass, DeviceDescriptor};
use crate::capability::CapabilitySet;
use crate::error::{AimError, Result};

/// Commands a device accepts through CONTROL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Describe the device.
    Info,
    /// Flush pending writes to the node.
    Flush,
    /// Wait for terminal output to drain (tty only).
    Drain,
    /// Revoke every daemon-held handle of the device (restricted only).
    Reset,
}

impl ControlCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlCommand::Info => "info",
            ControlCommand::Flush => "flush",
            ControlCommand::Drain => "drain",
            ControlCommand::Reset => "reset",
        }
    }

    /// Resolve `name` against the command set of `class`.
    pub fn for_class(name: &str, class: DeviceClass) -> Result<ControlCommand> {
        let command = match (name.trim(), class) {
            ("info", _) => ControlCommand::Info,
            ("flush", _) => ControlCommand::Flush,
            ("drain", DeviceClass::Tty) => ControlCommand::Drain,
            ("reset", DeviceClass::Restricted) => ControlCommand::Reset,
            (other, class) => {
                return Err(AimError::InvalidOperation(format!(
                    "command '{}' not supported by {} devices",
                    other, class
                )))
            }
        };
        Ok(command)
    }

    /// Access the command makes to the device node, checked against the
    /// node's permission bits for the caller.
    pub fn node_access(self) -> Option<AccessMode> {
        match self {
            ControlCommand::Flush | ControlCommand::Drain => Some(AccessMode::Write),
            ControlCommand::Info | ControlCommand::Reset => None,
        }
    }

    /// Capabilities needed to run this command on `device`.
    pub fn required(self, device: &DeviceDescriptor) -> CapabilitySet {
        match self {
            ControlCommand::Info | ControlCommand::Drain => device.required_cap,
            ControlCommand::Flush => device.required_cap | CapabilitySet::FILE_W,
            ControlCommand::Reset => device.required_cap | CapabilitySet::SEC,
        }
    }

    /// Run a command that only touches the device node itself.
    ///
    /// `Reset` reaches into the principal table and is handled by the daemon.
    pub async fn run_on_node(self, device: &DeviceDescriptor) -> Result<BTreeMap<String, String>> {
        let mut result = BTreeMap::new();
        match self {
            ControlCommand::Info => {
                result.insert("name".to_string(), device.name.clone());
                result.insert("path".to_string(), device.path.display().to_string());
                result.insert("class".to_string(), device.class.to_string());
                result.insert("major".to_string(), device.major.to_string());
                result.insert("minor".to_string(), device.minor.to_string());
                result.insert("mode".to_string(), format!("{:04o}", device.mode));
                result.insert(
                    "owner".to_string(),
                    format!("{}:{}", device.owner_uid, device.owner_gid),
                );
                result.insert("required".to_string(), device.required_cap.to_string());
            }
            ControlCommand::Flush | ControlCommand::Drain => {
                let file = OpenOptions::new()
                    .write(true)
                    .custom_flags(nix::libc::O_CLOEXEC | nix::libc::O_NONBLOCK)
                    .open(&device.path)
                    .await?;
                file.sync_all().await.or_else(|err| {
                    // character devices commonly refuse fsync
                    if err.raw_os_error() == Some(nix::libc::EINVAL) {
                        Ok(())
                    } else {
                        Err(err)
                    }
                })?;
                result.insert(self.as_str().to_string(), "ok".to_string());
            }
            ControlCommand::Reset => {
                return Err(AimError::Internal(
                    "reset must be dispatched by the daemon".to_string(),
                ))
            }
        }
        Ok(result)
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
