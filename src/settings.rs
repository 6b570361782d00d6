use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub const DEFAULT_SCAN_TIMEOUT_MS: u64 = 60_000;

/// Source of the global scan timeout.
pub trait SettingsProvider: Send + Sync {
    fn scan_timeout_millis(&self) -> u64;

    fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_millis())
    }
}

/// Settings held in memory and adjustable while the service runs. Changes
/// only apply to runs started afterwards.
#[derive(Debug)]
pub struct RuntimeSettings {
    scan_timeout_ms: AtomicU64,
}

impl RuntimeSettings {
    pub fn new(scan_timeout_ms: u64) -> Self {
        Self {
            scan_timeout_ms: AtomicU64::new(scan_timeout_ms),
        }
    }

    pub fn set_scan_timeout_millis(&self, ms: u64) {
        self.scan_timeout_ms.store(ms, Ordering::Relaxed);
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self::new(DEFAULT_SCAN_TIMEOUT_MS)
    }
}

impl SettingsProvider for RuntimeSettings {
    fn scan_timeout_millis(&self) -> u64 {
        self.scan_timeout_ms.load(Ordering::Relaxed)
    }
}
