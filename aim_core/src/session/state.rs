use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::capability::CapabilitySet;

/// Who is on the other end of the socket, as reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

/// Filled in by a successful AUTHENTICATE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authentication {
    pub app_name: String,
    /// Opaque, caller-supplied
    pub fingerprint: String,
    pub token: String,
}

/// Per-connection state.
#[derive(Debug, Clone)]
pub struct Session {
    pub peer: PeerCredentials,
    pub connected_at: DateTime<Utc>,
    /// Mirror of the peer principal's base ∪ live-elevated set, refreshed
    /// after every request.
    pub granted_caps: CapabilitySet,
    auth: Option<Authentication>,
}

impl Session {
    pub fn new(peer: PeerCredentials) -> Self {
        Self {
            peer,
            connected_at: Utc::now(),
            granted_caps: CapabilitySet::empty(),
            auth: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.is_some()
    }

    pub fn authentication(&self) -> Option<&Authentication> {
        self.auth.as_ref()
    }

    /// Bind the session to a client and mint its token.
    pub fn authenticate(
        &mut self,
        app_name: impl Into<String>,
        fingerprint: impl Into<String>,
    ) -> &Authentication {
        self.auth.insert(Authentication {
            app_name: app_name.into(),
            fingerprint: fingerprint.into(),
            token: Uuid::new_v4().simple().to_string(),
        })
    }

    /// Session token, or `-` before authentication (for logging).
    pub fn token(&self) -> &str {
        self.auth.as_ref().map(|auth| auth.token.as_str()).unwrap_or("-")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_fresh() {
        let peer = PeerCredentials {
            pid: 10,
            uid: 1000,
            gid: 1000,
        };
        let mut first = Session::new(peer);
        let mut second = Session::new(peer);
        assert!(!first.is_authenticated());
        assert_eq!(first.token(), "-");

        let a = first.authenticate("editor", "abc").token.clone();
        let b = second.authenticate("editor", "abc").token.clone();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert_eq!(first.authentication().unwrap().fingerprint, "abc");
    }
}
