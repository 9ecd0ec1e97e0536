mod record;
mod registry;

pub use record::{Identity, OpenDevice, Principal};
pub use registry::{PrincipalRef, ProcessRegistry, Registration};
