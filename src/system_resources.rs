use log::{info, warn};
use sysinfo::{System, SystemExt};

// sysinfo 0.29 reports memory in bytes.
const BYTES_TO_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemorySnapshot {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl MemorySnapshot {
    pub fn current() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        Self {
            total_bytes: sys.total_memory(),
            available_bytes: sys.available_memory(),
        }
    }

    pub fn available_gb(&self) -> f64 {
        self.available_bytes as f64 / BYTES_TO_GB
    }

    pub fn total_gb(&self) -> f64 {
        self.total_bytes as f64 / BYTES_TO_GB
    }

    pub fn fits(&self, required_bytes: u64) -> bool {
        required_bytes <= self.available_bytes
    }
}

/// Logs whether `required_bytes` fits in available memory. Loading proceeds either way.
pub fn check_memory(required_bytes: u64, snapshot: &MemorySnapshot) -> bool {
    let required_gb = required_bytes as f64 / BYTES_TO_GB;
    if snapshot.fits(required_bytes) {
        info!(
            "Model needs ~{:.2} GB, {:.2} GB of {:.2} GB available",
            required_gb,
            snapshot.available_gb(),
            snapshot.total_gb()
        );
        true
    } else {
        warn!(
            "Model needs ~{:.2} GB but only {:.2} GB of {:.2} GB is available; loading may fail or swap",
            required_gb,
            snapshot.available_gb(),
            snapshot.total_gb()
        );
        false
    }
}
