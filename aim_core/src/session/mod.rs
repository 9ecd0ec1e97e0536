//! Client sessions: per-connection state and the connection loop.

mod connection;
mod state;

pub use connection::{peer_credentials, send_response, serve};
pub use state::{Authentication, PeerCredentials, Session};
