//! Device descriptors, the device table, and per-class control commands.

mod control;
mod descriptor;
mod registry;

pub use control::ControlCommand;
pub use descriptor::{AccessMode, DeviceClass, DeviceDescriptor, MAX_DEVICE_NAME};
pub use registry::DeviceRegistry;
