use std::fs::File;
use std::io::{self, IoSlice};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, UnixAddr};
use tokio::io::{AsyncWriteExt, Interest};
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use super::state::{PeerCredentials, Session};
use crate::daemon::Daemon;
use crate::error::{AimError, Result};
use crate::handlers::{self, Outcome};
use crate::protocol::{
    encode_frame, read_frame, write_frame, RequestEnvelope, RequestType, Response, WireRecord,
};
use crate::shutdown::ShutdownHandle;

/// Kernel-reported credentials of the connected peer.
pub fn peer_credentials(stream: &UnixStream) -> Result<PeerCredentials> {
    let cred = stream.peer_cred()?;
    let pid = cred.pid().ok_or_else(|| {
        AimError::InvalidCredentials("socket layer did not report a peer pid".to_string())
    })?;
    Ok(PeerCredentials {
        pid,
        uid: cred.uid(),
        gid: cred.gid(),
    })
}

/// Serve one client connection until it closes, misframes, or the daemon
/// shuts down. Requests are handled strictly one after another.
pub async fn serve(daemon: Arc<Daemon>, mut stream: UnixStream, mut shutdown: ShutdownHandle) {
    let peer = match peer_credentials(&stream) {
        Ok(peer) => peer,
        Err(err) => {
            warn!("Rejecting connection: {}", err);
            let _ = send_response(&mut stream, &Response::failure(None, None, &err), None).await;
            return;
        }
    };
    let mut session = Session::new(peer);
    info!(pid = peer.pid, uid = peer.uid, "Client connected");

    loop {
        let frame = tokio::select! {
            _ = shutdown.wait_for_shutdown() => {
                debug!(session = %session.token(), "Closing session for shutdown");
                break;
            }
            frame = read_frame(&mut stream) => frame,
        };

        let payload = match frame {
            Ok(Some(payload)) => payload,
            Ok(None) => break,
            Err(err) if err.is_fatal() => {
                warn!(pid = peer.pid, "Closing connection: {}", err);
                let _ = send_response(&mut stream, &Response::failure(None, None, &err), None).await;
                break;
            }
            Err(err) => {
                debug!(pid = peer.pid, "Connection lost: {}", err);
                break;
            }
        };

        let outcome = match decode(&payload) {
            Ok(envelope) => handlers::dispatch(&daemon, &mut session, envelope).await,
            Err((reqtype, id, err)) => {
                debug!(pid = peer.pid, "Undecodable request: {}", err);
                Outcome::reply(Response::failure(reqtype, id, &err))
            }
        };

        let Outcome {
            response,
            passed_file,
            close,
        } = outcome;
        if let Err(err) = send_response(&mut stream, &response, passed_file.as_ref()).await {
            debug!(pid = peer.pid, "Failed to write response: {}", err);
            break;
        }
        // the client holds its own duplicate now
        drop(passed_file);

        if close {
            break;
        }
    }

    info!(pid = peer.pid, session = %session.token(), "Client disconnected");
}

type DecodeError = (Option<RequestType>, Option<String>, AimError);

fn decode(payload: &[u8]) -> std::result::Result<RequestEnvelope, DecodeError> {
    let record = WireRecord::parse(payload).map_err(|err| (None, None, err))?;
    RequestEnvelope::from_record(&record).map_err(|err| (record.reqtype, record.id.clone(), err))
}

/// Write a response frame, attaching `file` to its first byte when given.
pub async fn send_response(
    stream: &mut UnixStream,
    response: &Response,
    file: Option<&File>,
) -> Result<()> {
    let payload = response.to_record().serialize();
    match file {
        None => write_frame(stream, &payload).await,
        Some(file) => {
            let frame = encode_frame(&payload)?;
            let sent = send_with_fd(stream, &frame, file).await?;
            stream.write_all(&frame[sent..]).await?;
            stream.flush().await?;
            Ok(())
        }
    }
}

/// `sendmsg` with an `SCM_RIGHTS` message carrying `file`. Returns how
/// many bytes of `bytes` went out with it.
async fn send_with_fd(stream: &UnixStream, bytes: &[u8], file: &File) -> Result<usize> {
    let fds = [file.as_raw_fd()];
    loop {
        stream.writable().await?;
        let result = stream.try_io(Interest::WRITABLE, || {
            let iov = [IoSlice::new(bytes)];
            let cmsgs = [ControlMessage::ScmRights(&fds)];
            sendmsg::<UnixAddr>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
                .map_err(io::Error::from)
        });
        match result {
            Ok(sent) => return Ok(sent),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err.into()),
        }
    }
}
