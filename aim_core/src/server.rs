//! Control-socket listener.

use std::fs::{self, Permissions};
use std::future::Future;
use std::io;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::unistd::{chown, Group};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::daemon::Daemon;
use crate::error::{AimError, Result};
use crate::maintenance;
use crate::protocol::Response;
use crate::session;
use crate::shutdown::{ShutdownError, ShutdownManager};

/// A bound daemon, ready to accept clients.
#[derive(Debug)]
pub struct Server {
    daemon: Arc<Daemon>,
    listener: UnixListener,
    path: PathBuf,
    sessions: Arc<Semaphore>,
    shutdown: Arc<ShutdownManager>,
}

impl Server {
    /// Bind the configured socket, replacing a stale one. Must be called
    /// from within a tokio runtime.
    pub fn bind(daemon: Arc<Daemon>) -> Result<Self> {
        let config = daemon.config();
        let path = config.socket_path.clone();
        remove_stale_socket(&path)?;

        let listener = UnixListener::bind(&path)?;
        fs::set_permissions(&path, Permissions::from_mode(config.socket_mode))?;
        apply_group(&path, &config.socket_group);
        info!(socket = %path.display(), mode = %format!("{:04o}", config.socket_mode), "Listening");

        Ok(Self {
            sessions: Arc::new(Semaphore::new(config.max_sessions)),
            shutdown: Arc::new(ShutdownManager::new(config.shutdown_grace())),
            daemon,
            listener,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn daemon(&self) -> &Arc<Daemon> {
        &self.daemon
    }

    /// Accept clients until `signal` resolves, then stop every session
    /// within the grace period and remove the socket.
    pub async fn serve_until<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Server {
            daemon,
            listener,
            path,
            sessions,
            shutdown,
        } = self;

        let sweeper = tokio::spawn(maintenance::run(
            daemon.clone(),
            shutdown.register("maintenance"),
        ));

        tokio::pin!(signal);
        loop {
            let accepted = tokio::select! {
                _ = &mut signal => break,
                accepted = listener.accept() => accepted,
            };
            let stream = match accepted {
                Ok((stream, _)) => stream,
                Err(err) => {
                    // EMFILE and friends: keep the daemon up
                    error!("Accept failed: {}", err);
                    continue;
                }
            };

            match sessions.clone().try_acquire_owned() {
                Ok(permit) => {
                    let handle = shutdown.register("session");
                    let daemon = daemon.clone();
                    tokio::spawn(async move {
                        session::serve(daemon, stream, handle).await;
                        drop(permit);
                    });
                }
                Err(_) => {
                    warn!("Session limit reached, refusing connection");
                    tokio::spawn(refuse(stream));
                }
            }
        }

        info!("Shutting down");
        drop(listener);
        if let Err(err) = fs::remove_file(&path) {
            debug!("Could not remove {}: {}", path.display(), err);
        }

        match shutdown.request_shutdown().await {
            Ok(()) => {}
            Err(ShutdownError::Timeout(grace, running)) => {
                warn!(running, "Sessions still running after {:?}", grace)
            }
            Err(err) => warn!("Shutdown: {}", err),
        }
        if let Err(err) = sweeper.await {
            error!("Maintenance task failed: {}", err);
        }
        Ok(())
    }
}

async fn refuse(mut stream: UnixStream) {
    let err = AimError::ResourceExhausted("too many sessions".to_string());
    let _ = session::send_response(&mut stream, &Response::failure(None, None, &err), None).await;
}

/// Remove a leftover socket file. Anything else at the path is an error.
fn remove_stale_socket(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            debug!("Removing stale socket {}", path.display());
            fs::remove_file(path)?;
            Ok(())
        }
        Ok(_) => Err(AimError::Internal(format!(
            "{} exists and is not a socket",
            path.display()
        ))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Hand the socket to `group`, keeping its owner. Best-effort.
fn apply_group(path: &Path, group: &str) {
    match Group::from_name(group) {
        Ok(Some(group)) => {
            if let Err(err) = chown(path, None, Some(group.gid)) {
                warn!("Could not chown {} to group {}: {}", path.display(), group.name, err);
            }
        }
        Ok(None) => warn!("Socket group {} does not exist", group),
        Err(err) => warn!("Could not look up group {}: {}", group, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_socket_is_replaced_but_files_are_not() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("aim.sock");
        let _listener = std::os::unix::net::UnixListener::bind(&socket).unwrap();
        remove_stale_socket(&socket).unwrap();
        assert!(!socket.exists());

        let file = dir.path().join("regular");
        fs::write(&file, b"keep").unwrap();
        assert!(remove_stale_socket(&file).is_err());
        assert!(file.exists());

        remove_stale_socket(&dir.path().join("absent")).unwrap();
    }
}
