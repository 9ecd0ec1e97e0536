use std::collections::HashMap;

use tracing::debug;

use super::descriptor::{DeviceClass, DeviceDescriptor};

/// Device table. Filled at startup, read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, DeviceDescriptor>,
}

impl DeviceRegistry {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The static table every daemon starts from.
    pub fn builtin() -> Self {
        let table = [
            DeviceDescriptor::new("null", 1, 3, DeviceClass::Safe),
            DeviceDescriptor::new("zero", 1, 5, DeviceClass::Safe),
            DeviceDescriptor::new("full", 1, 7, DeviceClass::Safe),
            DeviceDescriptor::new("random", 1, 8, DeviceClass::Safe),
            DeviceDescriptor::new("urandom", 1, 9, DeviceClass::Safe),
            DeviceDescriptor::new("tty", 5, 0, DeviceClass::Tty),
            DeviceDescriptor::new("console", 5, 1, DeviceClass::Tty).with_mode(0o600),
            DeviceDescriptor::new("mem", 1, 1, DeviceClass::Restricted).with_mode(0o644),
            DeviceDescriptor::new("kmem", 1, 2, DeviceClass::Restricted)
                .with_owner(0, 15)
                .with_mode(0o640),
            DeviceDescriptor::new("port", 1, 4, DeviceClass::Restricted)
                .with_owner(0, 15)
                .with_mode(0o640),
            DeviceDescriptor::new("kmsg", 1, 11, DeviceClass::Misc).with_mode(0o644),
        ];
        Self::from_descriptors(table)
    }

    pub fn from_descriptors<I: IntoIterator<Item = DeviceDescriptor>>(descriptors: I) -> Self {
        let mut registry = Self::new();
        for descriptor in descriptors {
            registry.insert(descriptor);
        }
        registry
    }

    /// Add a descriptor, replacing any existing one of the same name.
    pub fn insert(&mut self, descriptor: DeviceDescriptor) {
        debug!(
            device = %descriptor.name,
            class = %descriptor.class,
            required = %descriptor.required_cap,
            "Registered device"
        );
        self.devices.insert(descriptor.name.clone(), descriptor);
    }

    pub fn get(&self, name: &str) -> Option<&DeviceDescriptor> {
        self.devices.get(name)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Device names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.devices.keys().cloned().collect();
        names.sort();
        names
    }
}
