//! `aim`: run the Application Interface Manager daemon or talk to it.

mod logging;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use aim_core::config::DEFAULT_CONFIG_PATH;
use aim_core::{AccessMode, AimClient, Capability, CapabilitySet, Daemon, DaemonConfig, Server};
use anyhow::{bail, Context};
use clap::{ArgAction, Parser, Subcommand};
use serde_json::json;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "aim")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Application Interface Manager daemon and client", long_about = None)]
struct Cli {
    /// Sets the level of verbosity
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Control socket, overriding the configured one
    #[arg(short, long, value_name = "PATH", global = true)]
    socket: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the daemon in the foreground
    Daemon {
        /// Log format: text or json
        #[arg(long, value_name = "FORMAT")]
        log_format: Option<String>,
    },

    /// Show daemon counters
    Status,

    /// Grant capabilities to a process for a while
    Elevate {
        /// Target process (0 for this one)
        pid: i32,

        /// Comma-separated capability names, e.g. NET,DEV
        caps: String,

        /// Seconds the grant lasts
        #[arg(short, long)]
        duration: Option<i64>,
    },

    /// Remove one capability from a process
    #[command(name = "drop")]
    DropCap {
        pid: i32,

        /// Capability name
        cap: String,
    },

    /// Ask whether a process holds capabilities
    Check {
        pid: i32,

        /// Comma-separated capability names
        caps: String,
    },

    /// Open a device through the daemon
    Open {
        device: String,

        /// r, w or rw
        #[arg(short, long, default_value = "r")]
        mode: String,
    },

    /// Run a device control command
    Control {
        device: String,
        command: String,

        /// Extra parameters
        #[arg(value_name = "KEY=VALUE")]
        params: Vec<String>,
    },

    /// Show recent audit entries, newest first
    Audit {
        #[arg(short = 'n', long, default_value_t = 50)]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut config = DaemonConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if let Some(socket) = &cli.socket {
        config.socket_path = socket.clone();
    }

    match cli.command {
        Commands::Daemon { log_format } => {
            if let Some(format) = log_format {
                config.log_format = format;
                config.validate()?;
            }
            logging::init(&logging::level_for(cli.verbose, &config.log_level), &config.log_format)?;
            run_daemon(config).await
        }
        command => {
            logging::init(&logging::level_for(cli.verbose, "warn"), "text")?;
            run_client(&config, command, cli.json).await
        }
    }
}

async fn run_daemon(config: DaemonConfig) -> anyhow::Result<()> {
    info!(version = aim_core::VERSION, "Starting aim daemon");
    let daemon = Arc::new(Daemon::new(config).context("invalid configuration")?);
    let server = Server::bind(daemon).context("binding control socket")?;
    server.serve_until(shutdown_signal()).await?;
    info!("Daemon stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(err) => {
            warn!("Cannot watch SIGTERM: {}", err);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = terminate.recv() => info!("Received SIGTERM"),
    }
}

async fn run_client(config: &DaemonConfig, command: Commands, as_json: bool) -> anyhow::Result<()> {
    let mut client = AimClient::connect(&config.socket_path)
        .await
        .with_context(|| format!("connecting to {}", config.socket_path.display()))?;
    client
        .authenticate("aim-cli", concat!("aim-cli/", env!("CARGO_PKG_VERSION")))
        .await?;

    match command {
        Commands::Daemon { .. } => bail!("daemon is not a client command"),
        Commands::Status => {
            let status = client.status().await?;
            if as_json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("version:           {}", status.version);
                println!("processes:         {}", status.process_count);
                println!("devices:           {}", status.device_count);
                println!("elevations:        {}", status.elevations);
                println!("device opens:      {}", status.device_opens);
                println!("permission checks: {}", status.permission_checks);
                println!("denials:           {}", status.denials);
            }
        }
        Commands::Elevate { pid, caps, duration } => {
            let flags = CapabilitySet::parse(&caps)?;
            let granted = client.elevate(pid, flags, duration).await?;
            if as_json {
                println!("{}", json!({ "pid": pid, "granted": granted.names() }));
            } else if granted.is_empty() {
                println!("Nothing granted to {}", pid);
            } else {
                println!("Granted {} to {}", granted, pid);
            }
        }
        Commands::DropCap { pid, cap } => {
            let cap: Capability = cap.parse()?;
            client.drop_cap(pid, cap).await?;
            if as_json {
                println!("{}", json!({ "pid": pid, "dropped": cap.name() }));
            } else {
                println!("Dropped {} from {}", cap, pid);
            }
        }
        Commands::Check { pid, caps } => {
            let flags = CapabilitySet::parse(&caps)?;
            let allowed = client.check(pid, flags).await?;
            if as_json {
                println!("{}", json!({ "pid": pid, "caps": flags.names(), "allowed": allowed }));
            } else {
                println!("{}", if allowed { "allowed" } else { "denied" });
            }
        }
        Commands::Open { device, mode } => {
            let mode: AccessMode = mode.parse()?;
            let opened = client.open_device(&device, mode).await?;
            if as_json {
                println!("{}", json!({ "device": device, "handle_token": opened.token }));
            } else {
                println!("Opened {} ({}), handle {}", device, mode, opened.token);
            }
            client.release(&opened.token).await?;
        }
        Commands::Control {
            device,
            command,
            params,
        } => {
            let params = parse_params(&params)?;
            let result = client.control(&device, &command, params).await?;
            if as_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                for (key, value) in &result {
                    println!("{}: {}", key, value);
                }
            }
        }
        Commands::Audit { count } => {
            let text = client.audit(count).await?;
            if as_json {
                let lines: Vec<&str> = text.lines().collect();
                println!("{}", serde_json::to_string_pretty(&lines)?);
            } else {
                print!("{}", text);
            }
        }
    }

    client.close().await?;
    Ok(())
}

fn parse_params(params: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
    let mut parsed = BTreeMap::new();
    for param in params {
        let Some((key, value)) = param.split_once('=') else {
            bail!("expected KEY=VALUE, got {}", param);
        };
        if key.is_empty() {
            bail!("empty parameter name in {}", param);
        }
        parsed.insert(key.to_string(), value.to_string());
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_params() {
        let params = parse_params(&["speed=9600".to_string(), "note=a=b".to_string()]).unwrap();
        assert_eq!(params["speed"], "9600");
        assert_eq!(params["note"], "a=b");
        assert!(parse_params(&["flag".to_string()]).is_err());
        assert!(parse_params(&["=1".to_string()]).is_err());
    }

    #[test]
    fn test_cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["aim", "check", "42", "NET,DEV", "--socket", "/tmp/a.sock", "--json"])
            .unwrap();
        assert_eq!(cli.socket, Some(PathBuf::from("/tmp/a.sock")));
        assert!(cli.json);
        match cli.command {
            Commands::Check { pid, caps } => {
                assert_eq!(pid, 42);
                assert_eq!(caps, "NET,DEV");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_verify() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
