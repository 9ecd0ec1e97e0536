//! Request handlers.
//!
//! [`dispatch`] runs one decoded request against the daemon on behalf of
//! a session and always produces a response; handler errors become
//! `ERROR` responses here.

mod device;
mod elevate;
mod query;

use std::fs::File;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::audit::AuditAction;
use crate::daemon::Daemon;
use crate::error::{AimError, Result};
use crate::maintenance;
use crate::principal::{Identity, PrincipalRef, Registration};
use crate::protocol::{Request, RequestEnvelope, RequestType, Response};
use crate::session::Session;

/// What the session layer should do with a handled request.
#[derive(Debug)]
pub struct Outcome {
    pub response: Response,
    /// Descriptor to pass alongside the response (OPEN).
    pub passed_file: Option<File>,
    /// End the session after writing the response.
    pub close: bool,
}

impl Outcome {
    pub fn reply(response: Response) -> Self {
        Self {
            response,
            passed_file: None,
            close: false,
        }
    }
}

/// Handle one request. Never fails: errors are turned into responses.
pub async fn dispatch(daemon: &Daemon, session: &mut Session, envelope: RequestEnvelope) -> Outcome {
    let reqtype = envelope.request.request_type();
    let id = envelope.id.clone();

    match handle(daemon, session, envelope).await {
        Ok(outcome) => outcome,
        Err(err) => {
            match &err {
                AimError::Internal(detail) => {
                    error!(session = %session.token(), request = %reqtype, "Internal failure: {}", detail)
                }
                other => {
                    debug!(session = %session.token(), request = %reqtype, code = other.code(), "Request refused: {}", other)
                }
            }
            Outcome::reply(Response::failure(Some(reqtype), id, &err))
        }
    }
}

async fn handle(daemon: &Daemon, session: &mut Session, envelope: RequestEnvelope) -> Result<Outcome> {
    let RequestEnvelope { id, pid, request } = envelope;

    if let Some(claimed) = pid {
        if claimed != session.peer.pid {
            daemon.audit().record(
                AuditAction::NamespaceViolation,
                session.peer.pid,
                format!("claimed pid {}", claimed),
            );
            warn!(peer = session.peer.pid, claimed, "Request pid does not match socket credentials");
            return Err(AimError::NamespaceViolation {
                claimed,
                peer: session.peer.pid,
            });
        }
    }

    if !session.is_authenticated() {
        return match request {
            Request::Authenticate {
                app_name,
                fingerprint,
            } => authenticate(daemon, session, id, app_name, fingerprint),
            _ => Err(AimError::AuthorizationFailed(
                "session is not authenticated".to_string(),
            )),
        };
    }

    let caller = caller_principal(daemon, session)?;
    let reqtype = request.request_type();
    let outcome = match request {
        Request::Authenticate { .. } => Err(AimError::InvalidOperation(
            "session is already authenticated".to_string(),
        )),
        Request::Elevate {
            target_pid,
            flags,
            duration_secs,
        } => elevate::elevate(daemon, session, &caller, target_pid, flags, duration_secs)
            .map(|response| Outcome::reply(response.with_id(id))),
        Request::Drop { target_pid, flag } => {
            elevate::drop_capability(daemon, session, &caller, target_pid, flag)
                .map(|response| Outcome::reply(response.with_id(id)))
        }
        Request::Check { target_pid, flags } => {
            query::check(daemon, session, &caller, target_pid, flags)
                .map(|response| Outcome::reply(response.with_id(id)))
        }
        Request::Status => Ok(Outcome::reply(query::status(daemon).with_id(id))),
        Request::Audit { count } => Ok(Outcome::reply(query::audit(daemon, count).with_id(id))),
        Request::Open { device: name, mode } => device::open(daemon, &caller, &name, mode)
            .await
            .map(|(response, file)| Outcome {
                response: response.with_id(id),
                passed_file: Some(file),
                close: false,
            }),
        Request::Control {
            device: name,
            command,
            params,
        } => device::control(daemon, &caller, &name, &command, params)
            .await
            .map(|response| Outcome::reply(response.with_id(id))),
        Request::Close { handle_token } => match handle_token {
            Some(token) => device::release(&caller, &token)
                .map(|response| Outcome::reply(response.with_id(id))),
            None => {
                info!(session = %session.token(), pid = session.peer.pid, "Session closed by client");
                Ok(Outcome {
                    response: Response::ok(RequestType::Close, id),
                    passed_file: None,
                    close: true,
                })
            }
        },
    };

    session.granted_caps = caller.lock().effective_caps(Instant::now());
    debug!(session = %session.token(), request = %reqtype, "Request handled");
    outcome
}

fn authenticate(
    daemon: &Daemon,
    session: &mut Session,
    id: Option<String>,
    app_name: String,
    fingerprint: String,
) -> Result<Outcome> {
    if app_name.trim().is_empty() {
        return Err(AimError::InvalidOperation("app_name is empty".to_string()));
    }

    let peer = session.peer;
    let program = daemon
        .probe()
        .identity(peer.pid)
        .map(|identity| identity.program)
        .filter(|program| !program.is_empty())
        .unwrap_or_else(|| app_name.clone());
    let principal = register_peer(daemon, session, program)?;
    let base = principal.lock().base_caps;

    session.granted_caps = principal.lock().effective_caps(Instant::now());
    let auth = session.authenticate(app_name, fingerprint);
    info!(
        session = %auth.token,
        pid = peer.pid,
        uid = peer.uid,
        app = %auth.app_name,
        caps = %base,
        "Session authenticated"
    );

    Ok(Outcome::reply(
        Response::ok(RequestType::Authenticate, id)
            .with("token", &auth.token)
            .with("permissions", base),
    ))
}

/// Principal record of the session's own peer, recreated from the
/// session credentials if the sweep dropped it while the peer still lives.
fn caller_principal(daemon: &Daemon, session: &Session) -> Result<PrincipalRef> {
    let peer = session.peer;
    if let Some(principal) = daemon.processes().get(peer.pid) {
        if principal.lock().identity.is_owned_by(peer.uid, peer.gid) {
            return Ok(principal);
        }
    }
    if !daemon.probe().is_alive(peer.pid) {
        return Err(AimError::InvalidCredentials(format!(
            "peer process {} has exited",
            peer.pid
        )));
    }
    let program = session
        .authentication()
        .map(|auth| auth.app_name.clone())
        .unwrap_or_default();
    register_peer(daemon, session, program)
}

/// Register the peer under its socket credentials.
///
/// A record left by an earlier owner of the pid is retired, unless the
/// live process does not carry the peer's credentials either, in which
/// case the connection outlived its process.
fn register_peer(daemon: &Daemon, session: &Session, program: String) -> Result<PrincipalRef> {
    let peer = session.peer;
    if let Some(existing) = daemon.processes().get(peer.pid) {
        let stale = !existing.lock().identity.is_owned_by(peer.uid, peer.gid);
        let live_matches = daemon
            .probe()
            .identity(peer.pid)
            .map_or(false, |live| live.is_owned_by(peer.uid, peer.gid));
        if stale && !live_matches {
            return Err(AimError::InvalidCredentials(format!(
                "pid {} now belongs to another process",
                peer.pid
            )));
        }
    }
    let registration = daemon
        .processes()
        .register(peer.pid, Identity::new(peer.uid, peer.gid, program));
    Ok(adopt(daemon, peer.pid, registration))
}

/// Take a registration, retiring any record it displaced.
fn adopt(daemon: &Daemon, pid: i32, registration: Registration) -> PrincipalRef {
    if let Some(stale) = registration.displaced {
        warn!(pid, "Pid reused by another identity; retiring the stale record");
        maintenance::retire(daemon, pid, &stale);
    }
    registration.principal
}

/// Resolve a `target_pid` field; 0 addresses the caller.
fn resolve_target(
    daemon: &Daemon,
    session: &Session,
    caller: &PrincipalRef,
    target_pid: i32,
) -> Result<(i32, PrincipalRef)> {
    if target_pid == 0 || target_pid == session.peer.pid {
        return Ok((session.peer.pid, caller.clone()));
    }
    if !daemon.probe().is_alive(target_pid) {
        return Err(AimError::InvalidCredentials(format!(
            "process {} does not exist",
            target_pid
        )));
    }
    let registration = daemon.processes().acquire(target_pid, daemon.probe())?;
    Ok((target_pid, adopt(daemon, target_pid, registration)))
}


#[cfg(test)]
mod tests {
    use super::test_support::Harness;
    use super::*;
    use crate::capability::CapabilitySet;
    use crate::config::DaemonConfig;
    use crate::session::PeerCredentials;

    #[tokio::test]
    async fn test_requests_before_auth_are_refused() {
        let harness = Harness::new(DaemonConfig::default());
        let mut session = Session::new(PeerCredentials {
            pid: 50,
            uid: 1000,
            gid: 1000,
        });
        let response = harness.call(&mut session, Request::Status).await;
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("authorization_failed"));
    }

    #[tokio::test]
    async fn test_authenticate_reports_base_caps() {
        let harness = Harness::new(DaemonConfig::default());
        harness.probe.spawn(60, Identity::new(1000, 1000, "shell"));
        let mut session = Session::new(PeerCredentials {
            pid: 60,
            uid: 1000,
            gid: 1000,
        });
        let response = harness
            .call(
                &mut session,
                Request::Authenticate {
                    app_name: "editor".into(),
                    fingerprint: "abc".into(),
                },
            )
            .await;
        assert!(response.success);
        assert_eq!(response.data["permissions"], "USR,PROC,FILE_R");
        assert_eq!(response.data["token"].len(), 32);
        assert_eq!(session.granted_caps, CapabilitySet::USER_BASE);

        let principal = harness.daemon.processes().get(60).unwrap();
        assert_eq!(principal.lock().identity.program, "shell");

        // a second handshake on the same connection is refused
        let again = harness
            .call(
                &mut session,
                Request::Authenticate {
                    app_name: "editor".into(),
                    fingerprint: "abc".into(),
                },
            )
            .await;
        assert_eq!(again.error.as_deref(), Some("invalid_operation"));
    }

    #[tokio::test]
    async fn test_reused_pid_gets_a_fresh_record() {
        let harness = Harness::new(DaemonConfig::default());
        let mut observer = harness.session(10, 1000).await;
        harness.probe.spawn(700, Identity::new(0, 0, "rootd"));
        let check = harness
            .call(
                &mut observer,
                Request::Check {
                    target_pid: 700,
                    flags: CapabilitySet::ROOT,
                },
            )
            .await;
        assert_eq!(check.data["result"], "1");

        harness.probe.kill(700);
        harness.probe.spawn(700, Identity::new(1000, 1000, "game"));
        let mut session = Session::new(PeerCredentials {
            pid: 700,
            uid: 1000,
            gid: 1000,
        });
        let response = harness
            .call(
                &mut session,
                Request::Authenticate {
                    app_name: "game".into(),
                    fingerprint: "abc".into(),
                },
            )
            .await;
        assert!(response.success, "{:?}", response);
        assert_eq!(response.data["permissions"], "USR,PROC,FILE_R");
        assert_eq!(session.granted_caps, CapabilitySet::USER_BASE);

        let check = harness
            .call(
                &mut session,
                Request::Check {
                    target_pid: 0,
                    flags: CapabilitySet::all(),
                },
            )
            .await;
        assert_eq!(check.data["result"], "0");

        let reaps = harness.daemon.audit().by_action(AuditAction::Reap);
        assert_eq!(reaps.len(), 1);
        assert_eq!(reaps[0].pid, 700);
        assert_eq!(reaps[0].details, "handles=0 program=rootd");
    }

    #[tokio::test]
    async fn test_stale_session_cannot_reclaim_reused_pid() {
        let harness = Harness::new(DaemonConfig::default());
        let mut stale = harness.session(710, 0).await;

        harness.probe.kill(710);
        let mut fresh = Session::new(PeerCredentials {
            pid: 710,
            uid: 1000,
            gid: 1000,
        });
        harness.probe.spawn(710, Identity::new(1000, 1000, "game"));
        let response = harness
            .call(
                &mut fresh,
                Request::Authenticate {
                    app_name: "game".into(),
                    fingerprint: "abc".into(),
                },
            )
            .await;
        assert!(response.success, "{:?}", response);

        // the old root connection no longer maps onto a live root process
        let status = harness.call(&mut stale, Request::Status).await;
        assert_eq!(status.error.as_deref(), Some("invalid_credentials"));

        // nor can a connection made by it before exiting
        let mut late = Session::new(PeerCredentials {
            pid: 710,
            uid: 0,
            gid: 0,
        });
        let response = harness
            .call(
                &mut late,
                Request::Authenticate {
                    app_name: "rootd".into(),
                    fingerprint: "abc".into(),
                },
            )
            .await;
        assert_eq!(response.error.as_deref(), Some("invalid_credentials"));
        let principal = harness.daemon.processes().get(710).unwrap();
        assert_eq!(principal.lock().base_caps, CapabilitySet::USER_BASE);
    }

    #[tokio::test]
    async fn test_pid_mismatch_is_audited() {
        let harness = Harness::new(DaemonConfig::default());
        let mut session = harness.session(70, 1000).await;
        let outcome = dispatch(
            &harness.daemon,
            &mut session,
            RequestEnvelope::new(Request::Status).with_pid(71).with_id("9"),
        )
        .await;
        assert_eq!(outcome.response.error.as_deref(), Some("namespace_violation"));
        assert_eq!(outcome.response.id.as_deref(), Some("9"));
        assert!(!outcome.close);
        assert_eq!(
            harness
                .daemon
                .audit()
                .by_action(AuditAction::NamespaceViolation)
                .len(),
            1
        );

        // matching pid is accepted
        let outcome = dispatch(
            &harness.daemon,
            &mut session,
            RequestEnvelope::new(Request::Status).with_pid(70),
        )
        .await;
        assert!(outcome.response.success);
    }

    #[tokio::test]
    async fn test_close_without_token_ends_session() {
        let harness = Harness::new(DaemonConfig::default());
        let mut session = harness.session(80, 1000).await;
        let outcome = dispatch(
            &harness.daemon,
            &mut session,
            RequestEnvelope::new(Request::Close { handle_token: None }),
        )
        .await;
        assert!(outcome.response.success);
        assert!(outcome.close);
    }
}
