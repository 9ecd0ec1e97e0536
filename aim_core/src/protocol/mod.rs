//! Wire protocol spoken over the control socket.
//!
//! A frame is a big-endian `u32` length followed by that many payload
//! bytes. The payload is a line-oriented `KEY:VALUE` record, which
//! [`message`] turns into typed requests and responses.

pub mod frame;
pub mod message;
pub mod record;

pub use frame::{encode_frame, read_frame, write_frame, MAX_FRAME_LEN};
pub use message::{Request, RequestEnvelope, RequestType, Response};
pub use record::{MessageType, WireRecord};
