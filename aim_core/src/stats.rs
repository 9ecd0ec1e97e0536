use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Monotonic daemon counters.
#[derive(Debug, Default)]
pub struct Stats {
    elevations: AtomicU64,
    device_opens: AtomicU64,
    permission_checks: AtomicU64,
    denials: AtomicU64,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub elevations: u64,
    pub device_opens: u64,
    pub permission_checks: u64,
    pub denials: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_elevation(&self) {
        self.elevations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_device_open(&self) {
        self.device_opens.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_check(&self) {
        self.permission_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_denial(&self) {
        self.denials.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            elevations: self.elevations.load(Ordering::Relaxed),
            device_opens: self.device_opens.load(Ordering::Relaxed),
            permission_checks: self.permission_checks.load(Ordering::Relaxed),
            denials: self.denials.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = Stats::new();
        stats.record_check();
        stats.record_check();
        stats.record_denial();
        stats.record_elevation();
        stats.record_device_open();

        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                elevations: 1,
                device_opens: 1,
                permission_checks: 2,
                denials: 1,
            }
        );
    }
}
