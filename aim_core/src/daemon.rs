use std::sync::Arc;

use tracing::{info, warn};

use crate::audit::AuditRing;
use crate::config::DaemonConfig;
use crate::device::DeviceRegistry;
use crate::engine::PermissionEngine;
use crate::error::ConfigError;
use crate::kernel::{IoctlMirror, KernelMirror};
use crate::principal::ProcessRegistry;
use crate::probe::{ProcFs, ProcessProbe};

/// All daemon state. Shared by handle between the accept loop, every
/// session task and the maintenance task.
#[derive(Debug)]
pub struct Daemon {
    config: DaemonConfig,
    processes: ProcessRegistry,
    devices: DeviceRegistry,
    audit: AuditRing,
    engine: PermissionEngine,
    probe: Arc<dyn ProcessProbe>,
    kernel: Option<Box<dyn KernelMirror>>,
}

impl Daemon {
    /// Daemon over procfs, attaching the kernel mirror if its node exists.
    pub fn new(config: DaemonConfig) -> Result<Self, ConfigError> {
        let kernel = match &config.kernel_device {
            Some(path) => match IoctlMirror::open(path) {
                Ok(mirror) => mirror.map(|m| Box::new(m) as Box<dyn KernelMirror>),
                Err(err) => {
                    warn!("Kernel mirror at {} unusable: {}", path.display(), err);
                    None
                }
            },
            None => None,
        };
        let mut daemon = Self::with_probe(config, Arc::new(ProcFs::new()))?;
        daemon.kernel = kernel;
        Ok(daemon)
    }

    /// Daemon over an explicit process probe and no kernel mirror.
    pub fn with_probe(
        config: DaemonConfig,
        probe: Arc<dyn ProcessProbe>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let devices = config.device_registry()?;
        info!(
            devices = devices.len(),
            audit_capacity = config.audit_capacity,
            "Daemon state initialized"
        );
        Ok(Self {
            processes: ProcessRegistry::new(config.system_uid_max),
            audit: AuditRing::new(config.audit_capacity),
            engine: PermissionEngine::new(),
            devices,
            probe,
            kernel: None,
            config,
        })
    }

    pub fn with_kernel_mirror(mut self, mirror: Box<dyn KernelMirror>) -> Self {
        self.kernel = Some(mirror);
        self
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn processes(&self) -> &ProcessRegistry {
        &self.processes
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    pub fn audit(&self) -> &AuditRing {
        &self.audit
    }

    pub fn engine(&self) -> &PermissionEngine {
        &self.engine
    }

    pub fn probe(&self) -> &dyn ProcessProbe {
        self.probe.as_ref()
    }

    pub fn kernel(&self) -> Option<&dyn KernelMirror> {
        self.kernel.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::InMemoryProbe;

    #[test]
    fn test_with_probe_builds_registries() {
        let config = DaemonConfig::from_toml("audit_capacity = 8").unwrap();
        let daemon = Daemon::with_probe(config, Arc::new(InMemoryProbe::new())).unwrap();
        assert_eq!(daemon.audit().capacity(), 8);
        assert!(daemon.processes().is_empty());
        assert!(daemon.devices().get("null").is_some());
        assert!(daemon.kernel().is_none());
    }

    #[test]
    fn test_missing_kernel_node_leaves_daemon_authoritative() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig {
            kernel_device: Some(dir.path().join("kaim")),
            ..DaemonConfig::default()
        };
        let daemon = Daemon::new(config).unwrap();
        assert!(daemon.kernel().is_none());
    }
}
