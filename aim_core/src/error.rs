use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AimError>;

/// Errors surfaced to clients as the `ERROR` field of a response.
#[derive(Debug, Error)]
pub enum AimError {
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Namespace violation: request pid {claimed} does not match peer pid {peer}")]
    NamespaceViolation { claimed: i32, peer: i32 },

    #[error("Authorization failed: {0}")]
    AuthorizationFailed(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AimError {
    /// Stable wire code carried in the `ERROR` field.
    pub fn code(&self) -> &'static str {
        match self {
            AimError::InvalidCredentials(_) => "invalid_credentials",
            AimError::NamespaceViolation { .. } => "namespace_violation",
            AimError::AuthorizationFailed(_) => "authorization_failed",
            AimError::InvalidOperation(_) => "invalid_operation",
            AimError::InvalidMessage(_) => "invalid_message",
            AimError::ResourceExhausted(_) => "resource_exhausted",
            AimError::Internal(_) => "internal",
        }
    }

    /// Text sent to the client next to the code. Internal failures stay opaque.
    pub fn client_message(&self) -> String {
        match self {
            AimError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }

    /// Whether the connection must be closed after reporting this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AimError::InvalidMessage(_))
    }
}

impl From<io::Error> for AimError {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) if code == nix::libc::EMFILE || code == nix::libc::ENFILE => {
                AimError::ResourceExhausted(format!("file table exhausted: {}", err))
            }
            _ => AimError::Internal(err.to_string()),
        }
    }
}

impl From<nix::Error> for AimError {
    fn from(err: nix::Error) -> Self {
        AimError::from(io::Error::from(err))
    }
}

/// Errors raised while loading the daemon configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid device entry: {0}")]
    InvalidDevice(String),

    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes() {
        assert_eq!(
            AimError::InvalidCredentials("x".into()).code(),
            "invalid_credentials"
        );
        assert_eq!(
            AimError::NamespaceViolation { claimed: 1, peer: 2 }.code(),
            "namespace_violation"
        );
        assert_eq!(AimError::InvalidMessage("x".into()).code(), "invalid_message");
        assert_eq!(AimError::Internal("x".into()).code(), "internal");
    }

    #[test]
    fn test_internal_detail_is_not_exposed() {
        let err = AimError::Internal("open(/dev/secret) failed".into());
        assert_eq!(err.client_message(), "internal error");
        assert!(!err.client_message().contains("secret"));
    }

    #[test]
    fn test_fd_exhaustion_maps_to_resource_exhausted() {
        let err = AimError::from(io::Error::from_raw_os_error(nix::libc::EMFILE));
        assert_eq!(err.code(), "resource_exhausted");

        let err = AimError::from(io::Error::from_raw_os_error(nix::libc::EIO));
        assert_eq!(err.code(), "internal");
    }

    #[test]
    fn test_only_framing_errors_are_fatal() {
        assert!(AimError::InvalidMessage("too big".into()).is_fatal());
        assert!(!AimError::AuthorizationFailed("no".into()).is_fatal());
    }
}
