use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::record::{Identity, Principal};
use crate::error::{AimError, Result};
use crate::probe::ProcessProbe;

/// Shared handle to a principal; the mutex is the per-record lock.
pub type PrincipalRef = Arc<Mutex<Principal>>;

/// Result of [`ProcessRegistry::register`].
#[derive(Debug)]
pub struct Registration {
    pub principal: PrincipalRef,
    /// Stale record of a previous holder of the pid, no longer in the map.
    pub displaced: Option<PrincipalRef>,
}

/// Concurrent map from pid to principal record.
///
/// The map is sharded; lookups take a shard read lock and mutation of a
/// record only ever holds that record's own mutex.
#[derive(Debug)]
pub struct ProcessRegistry {
    principals: DashMap<i32, PrincipalRef>,
    system_uid_max: u32,
}

impl ProcessRegistry {
    /// Create an empty registry.
    pub fn new(system_uid_max: u32) -> Self {
        Self {
            principals: DashMap::new(),
            system_uid_max,
        }
    }

    pub fn get(&self, pid: i32) -> Option<PrincipalRef> {
        self.principals.get(&pid).map(|entry| entry.value().clone())
    }

    /// Record a process under a known identity.
    ///
    /// An existing record is kept while it belongs to the same uid and gid.
    /// A record left behind by an earlier process under another identity
    /// is dropped from the map and handed back as `displaced`.
    pub fn register(&self, pid: i32, identity: Identity) -> Registration {
        let mut displaced = None;
        if let Some(existing) = self.get(pid) {
            if existing.lock().identity.is_owned_by(identity.uid, identity.gid) {
                return Registration {
                    principal: existing,
                    displaced: None,
                };
            }
            displaced = self
                .principals
                .remove_if(&pid, |_, current| Arc::ptr_eq(current, &existing))
                .map(|(_, principal)| principal);
            if displaced.is_some() {
                debug!(pid, uid = identity.uid, "Pid reused under another identity, record replaced");
            }
        }

        let base = identity.base_caps(self.system_uid_max);
        let principal = self
            .principals
            .entry(pid)
            .or_insert_with(|| {
                debug!(pid, uid = identity.uid, caps = %base, "Principal created");
                Arc::new(Mutex::new(Principal::new(pid, identity, base)))
            })
            .value()
            .clone();
        Registration { principal, displaced }
    }

    /// Look up `pid` against its current kernel-visible identity, creating
    /// the record on first sight.
    pub fn acquire(&self, pid: i32, probe: &dyn ProcessProbe) -> Result<Registration> {
        let identity = probe
            .identity(pid)
            .ok_or_else(|| AimError::InvalidCredentials(format!("process {} does not exist", pid)))?;
        Ok(self.register(pid, identity))
    }

    pub fn remove(&self, pid: i32) -> Option<PrincipalRef> {
        self.principals.remove(&pid).map(|(_, principal)| principal)
    }

    /// Clone out every record so callers can lock them one at a time
    /// without holding shard locks.
    pub fn snapshot(&self) -> Vec<(i32, PrincipalRef)> {
        self.principals
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.principals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.principals.is_empty()
    }

    pub fn system_uid_max(&self) -> u32 {
        self.system_uid_max
    }
}
