use std::collections::BTreeMap;
use std::fs::File;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::AuditAction;
use crate::daemon::Daemon;
use crate::device::{AccessMode, ControlCommand, DeviceDescriptor};
use crate::engine::Mediation;
use crate::error::{AimError, Result};
use crate::principal::{OpenDevice, PrincipalRef};
use crate::protocol::{RequestType, Response};

fn lookup<'a>(daemon: &'a Daemon, name: &str) -> Result<&'a DeviceDescriptor> {
    daemon
        .devices()
        .get(name)
        .ok_or_else(|| AimError::InvalidOperation(format!("unknown device: {}", name)))
}

/// Open `name` for the caller. Returns the response and the duplicate
/// descriptor to hand to the client; the daemon keeps the original.
pub(super) async fn open(
    daemon: &Daemon,
    caller: &PrincipalRef,
    name: &str,
    mode: AccessMode,
) -> Result<(Response, File)> {
    let device = lookup(daemon, name)?;

    let (pid, permitted, identity_ok, missing) = {
        let principal = caller.lock();
        let now = Instant::now();
        let decision = daemon.engine().evaluate(
            &principal,
            device.required_cap,
            now,
            Mediation::Mediated,
        );
        let missing = device.required_cap - principal.effective_caps(now);
        (
            principal.pid,
            decision.is_allowed(),
            device.permits(&principal.identity, mode),
            missing,
        )
    };

    if !permitted {
        daemon.audit().record(
            AuditAction::OpenDenied,
            pid,
            format!("device={} mode={} missing={}", name, mode, missing),
        );
        return Err(AimError::AuthorizationFailed(format!(
            "opening {} requires {}",
            name, device.required_cap
        )));
    }
    if !identity_ok {
        daemon.engine().stats().record_denial();
        daemon.audit().record(
            AuditAction::OpenDenied,
            pid,
            format!("device={} mode={} permission bits {:04o}", name, mode, device.mode),
        );
        return Err(AimError::AuthorizationFailed(format!(
            "permission bits of {} deny mode {}",
            name, mode
        )));
    }

    let file = device.open(mode).await.map_err(|err| {
        let err = AimError::from(err);
        debug!(device = %name, path = %device.path.display(), "Device open failed: {}", err);
        err
    })?;
    let passed = file.try_clone()?;

    let token = Uuid::new_v4().simple().to_string();
    caller.lock().attach_device(OpenDevice {
        token: token.clone(),
        device: name.to_string(),
        mode,
        opened_at: Utc::now(),
        file,
    });
    daemon.engine().stats().record_device_open();
    daemon.audit().record(
        AuditAction::OpenOk,
        pid,
        format!("device={} mode={} token={}", name, mode, token),
    );
    info!(pid, device = %name, %mode, "Device opened");

    Ok((
        Response::ok(RequestType::Open, None).with("handle_token", token),
        passed,
    ))
}

pub(super) async fn control(
    daemon: &Daemon,
    caller: &PrincipalRef,
    name: &str,
    command: &str,
    params: BTreeMap<String, String>,
) -> Result<Response> {
    let device = lookup(daemon, name)?;
    let command = ControlCommand::for_class(command, device.class)?;
    let required = command.required(device);

    let (pid, permitted, identity_ok) = {
        let principal = caller.lock();
        let decision = daemon.engine().evaluate(
            &principal,
            required,
            Instant::now(),
            Mediation::Mediated,
        );
        let identity_ok = command
            .node_access()
            .map_or(true, |mode| device.permits(&principal.identity, mode));
        (principal.pid, decision.is_allowed(), identity_ok)
    };
    if !permitted {
        daemon.audit().record(
            AuditAction::ControlDenied,
            pid,
            format!("device={} command={}", name, command),
        );
        return Err(AimError::AuthorizationFailed(format!(
            "{} on {} requires {}",
            command, name, required
        )));
    }
    if !identity_ok {
        daemon.engine().stats().record_denial();
        daemon.audit().record(
            AuditAction::ControlDenied,
            pid,
            format!("device={} command={} permission bits {:04o}", name, command, device.mode),
        );
        return Err(AimError::AuthorizationFailed(format!(
            "permission bits of {} deny {}",
            name, command
        )));
    }

    let mut result = match command {
        ControlCommand::Reset => {
            let revoked = revoke_handles(daemon, name);
            let mut result = BTreeMap::new();
            result.insert("revoked".to_string(), revoked.to_string());
            result
        }
        other => other.run_on_node(device).await?,
    };
    for (key, value) in params {
        result.insert(format!("param.{}", key), value);
    }

    daemon.audit().record(
        AuditAction::ControlOk,
        pid,
        format!("device={} command={}", name, command),
    );

    let mut response = Response::ok(RequestType::Control, None);
    response.data = result;
    Ok(response)
}

/// Close every daemon-held handle of `device`, whoever holds it.
fn revoke_handles(daemon: &Daemon, device: &str) -> usize {
    daemon
        .processes()
        .snapshot()
        .into_iter()
        .map(|(_, principal)| principal.lock().release_device_by_name(device))
        .sum()
}

/// CLOSE with a handle token: release that one handle.
pub(super) fn release(caller: &PrincipalRef, token: &str) -> Result<Response> {
    let released = caller.lock().release_device(token);
    match released {
        Some(handle) => {
            debug!(device = %handle.device, token = %token, "Device handle released");
            Ok(Response::ok(RequestType::Close, None).with("handle_token", token))
        }
        None => Err(AimError::InvalidOperation(format!(
            "unknown handle token: {}",
            token
        ))),
    }
}
