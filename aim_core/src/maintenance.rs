//! Periodic sweep: expire lapsed elevations, reap principals whose
//! process is gone, and report the handles they still held.

use std::sync::Arc;

use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::audit::AuditAction;
use crate::daemon::Daemon;
use crate::principal::PrincipalRef;
use crate::shutdown::ShutdownHandle;

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub reaped: usize,
    pub leaked: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == SweepReport::default()
    }
}

/// Run one sweep at `now`.
pub fn sweep(daemon: &Daemon, now: Instant) -> SweepReport {
    let mut report = SweepReport::default();

    for (pid, principal) in daemon.processes().snapshot() {
        if principal.lock().expire(now) {
            debug!(pid, "Elevation expired");
            report.expired += 1;
        }

        if daemon.probe().is_alive(pid) {
            continue;
        }

        let leaked = retire(daemon, pid, &principal);
        daemon.processes().remove(pid);

        report.leaked += leaked;
        report.reaped += 1;
    }

    report
}

/// Close out a record whose process is gone: every handle it still held
/// is audited as `LEAK` and closed, then one `REAP` entry is written.
/// Returns the number of leaked handles. The caller removes the record.
pub fn retire(daemon: &Daemon, pid: i32, principal: &PrincipalRef) -> usize {
    let (handles, program) = {
        let mut record = principal.lock();
        (record.take_devices(), record.identity.program.clone())
    };
    for handle in &handles {
        daemon.audit().record(
            AuditAction::Leak,
            pid,
            format!("device={} token={}", handle.device, handle.token),
        );
    }
    daemon.audit().record(
        AuditAction::Reap,
        pid,
        format!("handles={} program={}", handles.len(), program),
    );
    info!(pid, handles = handles.len(), program = %program, "Reaped principal");
    let leaked = handles.len();
    // closes the daemon's descriptors
    drop(handles);
    leaked
}

/// Sweep every `sweep_interval` until shutdown.
pub async fn run(daemon: Arc<Daemon>, mut shutdown: ShutdownHandle) {
    let mut ticker = interval(daemon.config().sweep_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval = ?daemon.config().sweep_interval(), "Maintenance task started");

    loop {
        tokio::select! {
            _ = shutdown.wait_for_shutdown() => break,
            _ = ticker.tick() => {
                let report = sweep(&daemon, Instant::now());
                if !report.is_empty() {
                    debug!(
                        expired = report.expired,
                        reaped = report.reaped,
                        leaked = report.leaked,
                        "Sweep finished"
                    );
                }
            }
        }
    }

    debug!("Maintenance task stopped");
}
