use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use super::resolve_target;
use crate::audit::AuditAction;
use crate::capability::{Capability, CapabilitySet};
use crate::config::{MAX_ELEVATION_SECS, MIN_ELEVATION_SECS};
use crate::daemon::Daemon;
use crate::engine::Mediation;
use crate::error::{AimError, Result};
use crate::principal::PrincipalRef;
use crate::protocol::{RequestType, Response};
use crate::session::Session;

/// Requested duration clamped into the allowed window.
pub(crate) fn clamp_duration(requested: Option<i64>, default_secs: u64) -> u64 {
    let secs = requested.unwrap_or(default_secs as i64);
    secs.clamp(MIN_ELEVATION_SECS as i64, MAX_ELEVATION_SECS as i64) as u64
}

pub(super) fn elevate(
    daemon: &Daemon,
    session: &Session,
    caller: &PrincipalRef,
    target_pid: i32,
    requested: CapabilitySet,
    duration_secs: Option<i64>,
) -> Result<Response> {
    let now = Instant::now();
    let caller_pid = session.peer.pid;

    let (authorized, authority) = {
        let caller = caller.lock();
        let decision = daemon.engine().evaluate_any(
            &caller,
            &[CapabilitySet::ROOT, CapabilitySet::SYSTEM],
            now,
            Mediation::Mediated,
        );
        (decision.is_allowed(), caller.effective_caps(now).authority())
    };
    if !authorized {
        daemon.audit().record(
            AuditAction::ElevateDenied,
            caller_pid,
            format!("target={} flags={:#x} caller lacks ROOT or SYSTEM", target_pid, requested.bits()),
        );
        return Err(AimError::AuthorizationFailed(
            "elevation requires ROOT or SYSTEM".to_string(),
        ));
    }

    let (target_pid, target) = resolve_target(daemon, session, caller, target_pid)?;
    let grant = requested & authority;
    let secs = clamp_duration(duration_secs, daemon.config().default_elevation_secs);
    target.lock().elevate(grant, now + Duration::from_secs(secs));
    daemon.engine().stats().record_elevation();

    daemon.audit().record(
        AuditAction::ElevateOk,
        target_pid,
        format!("by={} grant={:#x} duration={}", caller_pid, grant.bits(), secs),
    );
    info!(pid = target_pid, by = caller_pid, grant = %grant, secs, "Elevation granted");

    if let Some(kernel) = daemon.kernel() {
        if let Err(err) = kernel.elevate(target_pid, grant, secs as u32) {
            warn!(pid = target_pid, "Kernel mirror elevate failed: {}", err);
        }
    }

    Ok(Response::ok(RequestType::Elevate, None)
        .with("granted", grant)
        .with("duration", secs))
}

pub(super) fn drop_capability(
    daemon: &Daemon,
    session: &Session,
    caller: &PrincipalRef,
    target_pid: i32,
    cap: Capability,
) -> Result<Response> {
    let caller_pid = session.peer.pid;
    let is_self = target_pid == 0 || target_pid == caller_pid;

    if !is_self {
        let allowed = {
            let caller = caller.lock();
            daemon
                .engine()
                .evaluate(&caller, CapabilitySet::ROOT, Instant::now(), Mediation::Mediated)
                .is_allowed()
        };
        if !allowed {
            daemon.audit().record(
                AuditAction::DropDenied,
                caller_pid,
                format!("target={} cap={} caller lacks ROOT", target_pid, cap),
            );
            return Err(AimError::AuthorizationFailed(format!(
                "dropping capabilities of pid {} requires ROOT",
                target_pid
            )));
        }
    }

    let (target_pid, target) = resolve_target(daemon, session, caller, target_pid)?;
    target.lock().drop_capability(cap);
    daemon
        .audit()
        .record(AuditAction::Drop, target_pid, format!("cap={} by={}", cap, caller_pid));

    if let Some(kernel) = daemon.kernel() {
        if let Err(err) = kernel.drop_cap(target_pid, cap.bit()) {
            warn!(pid = target_pid, "Kernel mirror drop failed: {}", err);
        }
    }

    Ok(Response::ok(RequestType::Drop, None))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Harness;
    use super::*;
    use crate::config::DaemonConfig;
    use crate::principal::Identity;
    use crate::protocol::Request;
    use proptest::prelude::*;

    #[test]
    fn test_clamp_duration() {
        assert_eq!(clamp_duration(None, 900), 900);
        assert_eq!(clamp_duration(Some(0), 900), 1);
        assert_eq!(clamp_duration(Some(-30), 900), 1);
        assert_eq!(clamp_duration(Some(7200), 900), 3600);
        assert_eq!(clamp_duration(Some(120), 900), 120);
    }

    proptest! {
        #[test]
        fn prop_duration_within_window(requested in proptest::option::of(any::<i64>())) {
            let secs = clamp_duration(requested, 900);
            prop_assert!((1..=3600).contains(&secs));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_grant_is_scoped_to_caller_authority() {
        let harness = Harness::new(DaemonConfig::default());
        let mut system = harness.session(200, 81).await;
        harness.probe.spawn(4321, Identity::new(1000, 1000, "worker"));

        let response = harness
            .call(
                &mut system,
                Request::Elevate {
                    target_pid: 4321,
                    flags: CapabilitySet::ROOT | CapabilitySet::NET,
                    duration_secs: Some(30),
                },
            )
            .await;
        assert!(response.success, "{:?}", response);
        assert_eq!(response.data["granted"], "NET");

        let target = harness.daemon.processes().get(4321).unwrap();
        let target = target.lock();
        assert_eq!(target.elevated_caps, CapabilitySet::NET);
        assert_eq!(
            target.elevation_deadline,
            Some(Instant::now() + Duration::from_secs(30))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_elevation_overwrites() {
        let harness = Harness::new(DaemonConfig::default());
        let mut root = harness.session(1, 0).await;
        harness.probe.spawn(500, Identity::new(1000, 1000, "worker"));

        for (flags, secs) in [(CapabilitySet::NET, 60), (CapabilitySet::LOG, 10)] {
            let response = harness
                .call(
                    &mut root,
                    Request::Elevate {
                        target_pid: 500,
                        flags,
                        duration_secs: Some(secs),
                    },
                )
                .await;
            assert!(response.success);
        }
        let target = harness.daemon.processes().get(500).unwrap();
        assert_eq!(target.lock().elevated_caps, CapabilitySet::LOG);
        assert_eq!(harness.daemon.engine().stats().snapshot().elevations, 2);
    }

    #[tokio::test]
    async fn test_vanished_target() {
        let harness = Harness::new(DaemonConfig::default());
        let mut root = harness.session(1, 0).await;
        let response = harness
            .call(
                &mut root,
                Request::Elevate {
                    target_pid: 9999,
                    flags: CapabilitySet::NET,
                    duration_secs: None,
                },
            )
            .await;
        assert_eq!(response.error.as_deref(), Some("invalid_credentials"));
        assert!(harness.daemon.processes().get(9999).is_none());
    }

    #[tokio::test]
    async fn test_drop_rules() {
        let harness = Harness::new(DaemonConfig::default());
        let mut user = harness.session(300, 1000).await;
        let mut root = harness.session(1, 0).await;
        harness.probe.spawn(301, Identity::new(1001, 1001, "other"));

        // own capabilities: unconditional
        let response = harness
            .call(
                &mut user,
                Request::Drop {
                    target_pid: 0,
                    flag: Capability::Proc,
                },
            )
            .await;
        assert!(response.success);
        assert!(!user.granted_caps.has(Capability::Proc));

        // someone else's: ROOT only
        let response = harness
            .call(
                &mut user,
                Request::Drop {
                    target_pid: 301,
                    flag: Capability::Usr,
                },
            )
            .await;
        assert_eq!(response.error.as_deref(), Some("authorization_failed"));
        let denied = harness.daemon.audit().by_action(AuditAction::DropDenied);
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].pid, 300);
        assert_eq!(denied[0].details, "target=301 cap=USR caller lacks ROOT");
        assert_eq!(harness.daemon.engine().stats().snapshot().denials, 1);

        let response = harness
            .call(
                &mut root,
                Request::Drop {
                    target_pid: 301,
                    flag: Capability::Usr,
                },
            )
            .await;
        assert!(response.success);
        let other = harness.daemon.processes().get(301).unwrap();
        assert!(!other.lock().base_caps.has(Capability::Usr));
        assert_eq!(harness.daemon.audit().by_action(AuditAction::Drop).len(), 2);
    }
}
