//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use aim_core::handlers::dispatch;
use aim_core::protocol::{Request, RequestEnvelope, Response};
use aim_core::session::{PeerCredentials, Session};
use aim_core::{AimClient, Daemon, DaemonConfig, Identity, InMemoryProbe, ProcFs, Server};
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("aim_core=debug"))
        .with_test_writer()
        .try_init();
}

/// Config with one extra device backed by a file under `dir`.
pub fn config_with_device(dir: &Path, name: &str, class: &str, required: Option<&str>, mode: u32) -> DaemonConfig {
    let path = dir.join(name);
    std::fs::write(&path, b"").unwrap();
    let required = required
        .map(|caps| {
            let names: Vec<String> = caps
                .split(',')
                .filter(|c| !c.is_empty())
                .map(|c| format!("\"{}\"", c))
                .collect();
            format!("required = [{}]", names.join(", "))
        })
        .unwrap_or_default();
    DaemonConfig::from_toml(&format!(
        r#"
        [[device]]
        name = "{}"
        path = "{}"
        class = "{}"
        mode = {}
        {}
        "#,
        name,
        path.display(),
        class,
        mode,
        required
    ))
    .unwrap()
}

/// Drives handlers directly, with a fabricated process table.
pub struct Bench {
    pub daemon: Daemon,
    pub probe: Arc<InMemoryProbe>,
}

impl Bench {
    pub fn new(config: DaemonConfig) -> Self {
        let probe = Arc::new(InMemoryProbe::new());
        let daemon = Daemon::with_probe(config, probe.clone()).unwrap();
        Self { daemon, probe }
    }

    /// Make a process exist without connecting it.
    pub fn spawn(&self, pid: i32, uid: u32, program: &str) {
        self.probe.spawn(pid, Identity::new(uid, uid, program));
    }

    /// Spawn `pid` and authenticate a session for it.
    pub async fn login(&self, pid: i32, uid: u32, program: &str) -> Session {
        self.spawn(pid, uid, program);
        let mut session = Session::new(PeerCredentials { pid, uid, gid: uid });
        let response = self
            .call(
                &mut session,
                Request::Authenticate {
                    app_name: program.to_string(),
                    fingerprint: "0".repeat(64),
                },
            )
            .await;
        assert!(response.success, "{:?}", response);
        session
    }

    pub async fn call(&self, session: &mut Session, request: Request) -> Response {
        dispatch(&self.daemon, session, RequestEnvelope::new(request))
            .await
            .response
    }
}

/// A daemon serving a socket in a temporary directory.
pub struct Running {
    pub path: PathBuf,
    pub daemon: Arc<Daemon>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<aim_core::Result<()>>,
    _dir: TempDir,
}

impl Running {
    /// Serve `config` with its socket moved into a fresh directory.
    pub async fn start(mut config: DaemonConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        config.socket_path = dir.path().join("aim.sock");
        config.shutdown_grace_ms = 1000;
        config.kernel_device = None;

        let daemon = Arc::new(Daemon::with_probe(config, Arc::new(ProcFs::new())).unwrap());
        let server = Server::bind(daemon.clone()).unwrap();
        let path = server.path().to_path_buf();

        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(server.serve_until(async {
            let _ = stopped.await;
        }));

        Self {
            path,
            daemon,
            stop: Some(stop),
            task,
            _dir: dir,
        }
    }

    pub async fn client(&self) -> AimClient {
        AimClient::connect(&self.path).await.unwrap()
    }

    /// Connected and authenticated.
    pub async fn login(&self) -> AimClient {
        let mut client = self.client().await;
        client.authenticate("itest", "fingerprint").await.unwrap();
        client
    }

    /// Signal shutdown and wait for the server to finish.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(Duration::from_secs(5), &mut self.task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}
