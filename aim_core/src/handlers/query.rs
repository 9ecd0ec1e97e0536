use tokio::time::Instant;
use tracing::{debug, warn};

use super::resolve_target;
use crate::capability::CapabilitySet;
use crate::daemon::Daemon;
use crate::engine::Mediation;
use crate::error::Result;
use crate::principal::PrincipalRef;
use crate::protocol::{RequestType, Response, MAX_FRAME_LEN};
use crate::session::Session;
use crate::VERSION;

pub(super) fn check(
    daemon: &Daemon,
    session: &Session,
    caller: &PrincipalRef,
    target_pid: i32,
    required: CapabilitySet,
) -> Result<Response> {
    let (target_pid, target) = resolve_target(daemon, session, caller, target_pid)?;
    let allowed = {
        let target = target.lock();
        daemon
            .engine()
            .evaluate(&target, required, Instant::now(), Mediation::Query)
            .is_allowed()
    };

    if let Some(kernel) = daemon.kernel() {
        match kernel.check(target_pid, required) {
            Ok(mirrored) if mirrored != allowed => warn!(
                pid = target_pid,
                required = %required,
                daemon = allowed,
                kernel = mirrored,
                "Kernel mirror disagrees on check"
            ),
            Ok(_) => {}
            Err(err) => warn!(pid = target_pid, "Kernel mirror check failed: {}", err),
        }
    }

    Ok(Response::ok(RequestType::Check, None).with("result", u8::from(allowed)))
}

pub(super) fn status(daemon: &Daemon) -> Response {
    let stats = daemon.engine().stats().snapshot();
    Response::ok(RequestType::Status, None)
        .with("version", VERSION)
        .with("process_count", daemon.processes().len())
        .with("device_count", daemon.devices().len())
        .with("elevations", stats.elevations)
        .with("device_opens", stats.device_opens)
        .with("permission_checks", stats.permission_checks)
        .with("denials", stats.denials)
}

/// Room left in a frame for `audit_text` after the rest of the response.
const AUDIT_TEXT_LIMIT: usize = MAX_FRAME_LEN - 4096;

pub(super) fn audit(daemon: &Daemon, count: usize) -> Response {
    let (lines, text) = daemon.audit().render_within(count, AUDIT_TEXT_LIMIT);
    if lines < count.min(daemon.audit().len()) {
        debug!(requested = count, sent = lines, "Audit reply truncated to fit one frame");
    }
    Response::ok(RequestType::Audit, None)
        .with("count", lines)
        .with("audit_text", text)
}
