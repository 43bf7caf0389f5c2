use std::time::Duration;

use serde::Deserialize;

/// Capability flags and timeouts for the device-sharing subsystem.
///
/// Passed in at construction; there are no process-wide toggles. A scheduler
/// embedding this crate typically deserializes one `SharingConfig` from its
/// deployment file and hands it to [`crate::DeviceSharing`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SharingConfig {
    /// Master switch for the sharing scheme. When off, every operation is a
    /// no-op and `has_device_request` reports false for all pods.
    pub sharing_enabled: bool,
    /// Serialize concurrent allocations against the same node through the
    /// annotation-based distributed lock.
    pub node_lock_enabled: bool,
    /// Seconds a node may stay in `Requesting` before its advertisement is
    /// treated as stale and retired.
    pub handshake_timeout_secs: u64,
    /// Seconds after which a held distributed node lock may be taken over.
    pub node_lock_expiry_secs: u64,
    /// Upper bound on any single annotation read or patch.
    pub patch_timeout_secs: u64,
}

impl Default for SharingConfig {
    fn default() -> Self {
        Self {
            sharing_enabled: true,
            node_lock_enabled: false,
            handshake_timeout_secs: 60,
            node_lock_expiry_secs: 300,
            patch_timeout_secs: 10,
        }
    }
}

impl SharingConfig {
    pub fn handshake_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.handshake_timeout_secs as i64)
    }

    pub fn node_lock_expiry(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.node_lock_expiry_secs as i64)
    }

    pub fn patch_timeout(&self) -> Duration {
        Duration::from_secs(self.patch_timeout_secs)
    }
}
