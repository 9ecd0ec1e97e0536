use std::collections::HashMap;
use std::fs::File;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::capability::{Capability, CapabilitySet};
use crate::device::AccessMode;

/// Kernel-visible identity of a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Real user id
    pub uid: u32,
    /// Real group id
    pub gid: u32,
    /// Program name as reported by the kernel
    pub program: String,
}

impl Identity {
    pub fn new(uid: u32, gid: u32, program: impl Into<String>) -> Self {
        Self {
            uid,
            gid,
            program: program.into(),
        }
    }

    /// Whether this identity carries the given real uid and gid.
    pub fn is_owned_by(&self, uid: u32, gid: u32) -> bool {
        self.uid == uid && self.gid == gid
    }

    /// Capabilities assigned when the process is first observed.
    pub fn base_caps(&self, system_uid_max: u32) -> CapabilitySet {
        match self.uid {
            0 => CapabilitySet::ROOT,
            uid if uid <= system_uid_max => CapabilitySet::SYSTEM,
            _ => CapabilitySet::USER_BASE,
        }
    }
}

/// A device handle held by the daemon on behalf of a principal.
#[derive(Debug)]
pub struct OpenDevice {
    pub token: String,
    pub device: String,
    pub mode: AccessMode,
    pub opened_at: DateTime<Utc>,
    /// Daemon-owned handle; dropping it closes the descriptor.
    pub file: File,
}

/// The daemon's record of one process.
#[derive(Debug)]
pub struct Principal {
    pub pid: i32,
    pub identity: Identity,
    pub base_caps: CapabilitySet,
    pub elevated_caps: CapabilitySet,
    /// `None` means no elevation is in force.
    pub elevation_deadline: Option<Instant>,
    pub open_devices: HashMap<String, OpenDevice>,
}

impl Principal {
    pub fn new(pid: i32, identity: Identity, base_caps: CapabilitySet) -> Self {
        Self {
            pid,
            identity,
            base_caps,
            elevated_caps: CapabilitySet::empty(),
            elevation_deadline: None,
            open_devices: HashMap::new(),
        }
    }

    /// Elevated capabilities still in force at `now`.
    ///
    /// Past the deadline the stored value is ignored even if the sweep
    /// has not cleared it yet.
    pub fn live_elevated(&self, now: Instant) -> CapabilitySet {
        match self.elevation_deadline {
            Some(deadline) if now < deadline => self.elevated_caps,
            _ => CapabilitySet::empty(),
        }
    }

    /// `base_caps ∪ live elevation`
    pub fn effective_caps(&self, now: Instant) -> CapabilitySet {
        self.base_caps | self.live_elevated(now)
    }

    /// Replace any prior elevation with `grant` until `deadline`.
    pub fn elevate(&mut self, grant: CapabilitySet, deadline: Instant) {
        self.elevated_caps = grant;
        self.elevation_deadline = Some(deadline);
    }

    /// Clear a lapsed elevation. Returns true if something was cleared.
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.elevation_deadline {
            Some(deadline) if deadline <= now => {
                self.elevated_caps = CapabilitySet::empty();
                self.elevation_deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Remove `cap` from both the base and the elevated set.
    pub fn drop_capability(&mut self, cap: Capability) {
        self.base_caps.remove(cap.bit());
        self.elevated_caps.remove(cap.bit());
    }

    pub fn attach_device(&mut self, handle: OpenDevice) {
        self.open_devices.insert(handle.token.clone(), handle);
    }

    pub fn release_device(&mut self, token: &str) -> Option<OpenDevice> {
        self.open_devices.remove(token)
    }

    /// Release every handle of `device`, returning how many were held.
    pub fn release_device_by_name(&mut self, device: &str) -> usize {
        let before = self.open_devices.len();
        self.open_devices.retain(|_, handle| handle.device != device);
        before - self.open_devices.len()
    }

    /// Detach all held handles, leaving the record without any.
    pub fn take_devices(&mut self) -> Vec<OpenDevice> {
        self.open_devices.drain().map(|(_, handle)| handle).collect()
    }
}
