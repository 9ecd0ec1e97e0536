//! Application Interface Manager.
//!
//! A privileged daemon that grants processes temporary, scoped capabilities
//! and mediates access to device nodes over a Unix control socket.

pub mod audit;
pub mod capability;
pub mod client;
pub mod config;
pub mod daemon;
pub mod device;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod kernel;
pub mod maintenance;
pub mod principal;
pub mod probe;
pub mod protocol;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod stats;

pub use audit::{AuditAction, AuditEntry, AuditRing};
pub use capability::{Capability, CapabilitySet};
pub use client::{AimClient, ClientError, ClientResult};
pub use config::DaemonConfig;
pub use daemon::Daemon;
pub use device::{AccessMode, DeviceClass, DeviceDescriptor, DeviceRegistry};
pub use engine::{Decision, Mediation, PermissionEngine};
pub use error::{AimError, ConfigError, Result};
pub use principal::{Identity, Principal, ProcessRegistry};
pub use probe::{InMemoryProbe, ProcFs, ProcessProbe};
pub use server::Server;

/// Daemon version reported by STATUS.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
