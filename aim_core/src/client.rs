//! Async client for the daemon's control socket.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, IoSliceMut};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags, UnixAddr};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, Interest};
use tokio::net::UnixStream;
use tracing::debug;

use crate::capability::{Capability, CapabilitySet};
use crate::device::AccessMode;
use crate::error::AimError;
use crate::protocol::frame::check_length;
use crate::protocol::{write_frame, Request, RequestEnvelope, Response, WireRecord};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] AimError),

    #[error("{code}: {message}")]
    Server { code: String, message: String },

    #[error("Daemon closed the connection")]
    Disconnected,

    #[error("Response is missing {0}")]
    MissingField(&'static str),
}

impl ClientError {
    /// Wire code of a daemon-side refusal.
    pub fn code(&self) -> Option<&str> {
        match self {
            ClientError::Server { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Reply to a successful AUTHENTICATE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated {
    pub token: String,
    pub permissions: CapabilitySet,
}

/// A device opened through the daemon.
#[derive(Debug)]
pub struct OpenedDevice {
    pub token: String,
    pub file: File,
}

/// Reply to STATUS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub version: String,
    pub process_count: u64,
    pub device_count: u64,
    pub elevations: u64,
    pub device_opens: u64,
    pub permission_checks: u64,
    pub denials: u64,
}

impl StatusReport {
    fn from_response(response: &Response) -> ClientResult<Self> {
        let number = |key: &'static str| -> ClientResult<u64> {
            response
                .data
                .get(key)
                .and_then(|value| value.parse().ok())
                .ok_or(ClientError::MissingField(key))
        };
        Ok(Self {
            version: response
                .data
                .get("version")
                .cloned()
                .ok_or(ClientError::MissingField("version"))?,
            process_count: number("process_count")?,
            device_count: number("device_count")?,
            elevations: number("elevations")?,
            device_opens: number("device_opens")?,
            permission_checks: number("permission_checks")?,
            denials: number("denials")?,
        })
    }
}

/// One connection to the daemon.
#[derive(Debug)]
pub struct AimClient {
    stream: UnixStream,
    pid: i32,
    next_id: u64,
}

impl AimClient {
    pub async fn connect<P: AsRef<Path>>(path: P) -> ClientResult<Self> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        debug!(socket = %path.as_ref().display(), "Connected to daemon");
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: UnixStream) -> Self {
        Self {
            stream,
            pid: std::process::id() as i32,
            next_id: 1,
        }
    }

    pub async fn authenticate(
        &mut self,
        app_name: &str,
        fingerprint: &str,
    ) -> ClientResult<Authenticated> {
        let response = self
            .call(Request::Authenticate {
                app_name: app_name.to_string(),
                fingerprint: fingerprint.to_string(),
            })
            .await?;
        let token = response
            .data
            .get("token")
            .cloned()
            .ok_or(ClientError::MissingField("token"))?;
        let permissions = CapabilitySet::parse(
            response
                .data
                .get("permissions")
                .map(String::as_str)
                .unwrap_or_default(),
        )?;
        Ok(Authenticated { token, permissions })
    }

    /// Elevate `target_pid` (0 for self). Returns the capabilities actually
    /// granted after scoping.
    pub async fn elevate(
        &mut self,
        target_pid: i32,
        flags: CapabilitySet,
        duration_secs: Option<i64>,
    ) -> ClientResult<CapabilitySet> {
        let response = self
            .call(Request::Elevate {
                target_pid,
                flags,
                duration_secs,
            })
            .await?;
        let granted = response.data.get("granted").map(String::as_str).unwrap_or_default();
        Ok(CapabilitySet::parse(granted)?)
    }

    pub async fn drop_cap(&mut self, target_pid: i32, flag: Capability) -> ClientResult<()> {
        self.call(Request::Drop { target_pid, flag }).await.map(|_| ())
    }

    pub async fn check(&mut self, target_pid: i32, flags: CapabilitySet) -> ClientResult<bool> {
        let response = self.call(Request::Check { target_pid, flags }).await?;
        match response.data.get("result").map(String::as_str) {
            Some("1") => Ok(true),
            Some("0") => Ok(false),
            _ => Err(ClientError::MissingField("result")),
        }
    }

    pub async fn open_device(&mut self, device: &str, mode: AccessMode) -> ClientResult<OpenedDevice> {
        let (response, mut fds) = self
            .exchange(Request::Open {
                device: device.to_string(),
                mode,
            })
            .await?;
        let token = response
            .data
            .get("handle_token")
            .cloned()
            .ok_or(ClientError::MissingField("handle_token"))?;
        let fd = fds.pop().ok_or(ClientError::MissingField("descriptor"))?;
        Ok(OpenedDevice {
            token,
            file: File::from(fd),
        })
    }

    pub async fn control(
        &mut self,
        device: &str,
        command: &str,
        params: BTreeMap<String, String>,
    ) -> ClientResult<BTreeMap<String, String>> {
        let response = self
            .call(Request::Control {
                device: device.to_string(),
                command: command.to_string(),
                params,
            })
            .await?;
        Ok(response.data)
    }

    pub async fn status(&mut self) -> ClientResult<StatusReport> {
        let response = self.call(Request::Status).await?;
        StatusReport::from_response(&response)
    }

    /// Most recent audit lines, newest first.
    pub async fn audit(&mut self, count: usize) -> ClientResult<String> {
        let response = self.call(Request::Audit { count }).await?;
        Ok(response.data.get("audit_text").cloned().unwrap_or_default())
    }

    /// Release one held device handle; the session stays open.
    pub async fn release(&mut self, handle_token: &str) -> ClientResult<()> {
        self.call(Request::Close {
            handle_token: Some(handle_token.to_string()),
        })
        .await
        .map(|_| ())
    }

    /// End the session.
    pub async fn close(mut self) -> ClientResult<()> {
        self.call(Request::Close { handle_token: None })
            .await
            .map(|_| ())
    }

    /// Send a raw request envelope and return the response as-is,
    /// successful or not.
    pub async fn send(&mut self, envelope: RequestEnvelope) -> ClientResult<Response> {
        let payload = envelope.to_record().serialize();
        write_frame(&mut self.stream, &payload).await?;
        let (frame, _fds) = read_response_raw(&mut self.stream).await?;
        Ok(Response::from_record(&WireRecord::parse(&frame)?)?)
    }

    async fn call(&mut self, request: Request) -> ClientResult<Response> {
        self.exchange(request).await.map(|(response, _)| response)
    }

    async fn exchange(&mut self, request: Request) -> ClientResult<(Response, Vec<OwnedFd>)> {
        let id = self.next_id;
        self.next_id += 1;
        let envelope = RequestEnvelope::new(request)
            .with_id(id.to_string())
            .with_pid(self.pid);

        write_frame(&mut self.stream, &envelope.to_record().serialize()).await?;
        let (frame, fds) = read_response_raw(&mut self.stream).await?;
        let response = Response::from_record(&WireRecord::parse(&frame)?)?;
        if !response.success {
            return Err(ClientError::Server {
                code: response.error.clone().unwrap_or_else(|| "internal".to_string()),
                message: response.message().unwrap_or_default().to_string(),
            });
        }
        Ok((response, fds))
    }
}

/// Read one response frame, collecting any descriptors passed with it.
pub(crate) async fn read_response_raw(
    stream: &mut UnixStream,
) -> ClientResult<(Vec<u8>, Vec<OwnedFd>)> {
    let mut header = [0u8; 4];
    let (mut filled, fds) = recv_with_fds(stream, &mut header).await?;
    if filled == 0 {
        return Err(ClientError::Disconnected);
    }
    while filled < header.len() {
        let n = stream.read(&mut header[filled..]).await?;
        if n == 0 {
            return Err(ClientError::Disconnected);
        }
        filled += n;
    }

    let len = check_length(u32::from_be_bytes(header))?;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok((payload, fds))
}

async fn recv_with_fds(stream: &UnixStream, buf: &mut [u8]) -> ClientResult<(usize, Vec<OwnedFd>)> {
    loop {
        stream.readable().await?;
        let result = stream.try_io(Interest::READABLE, || {
            let mut cmsg = nix::cmsg_space!([RawFd; 4]);
            let mut iov = [IoSliceMut::new(&mut *buf)];
            let msg = recvmsg::<UnixAddr>(
                stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg),
                MsgFlags::MSG_CMSG_CLOEXEC,
            )
            .map_err(io::Error::from)?;

            let mut fds = Vec::new();
            for cmsg in msg.cmsgs() {
                if let ControlMessageOwned::ScmRights(raw) = cmsg {
                    // SAFETY: descriptors received through SCM_RIGHTS are
                    // freshly installed in this process and owned by nobody else.
                    fds.extend(raw.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
                }
            }
            Ok((msg.bytes, fds))
        });
        match result {
            Ok(received) => return Ok(received),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err.into()),
        }
    }
}
