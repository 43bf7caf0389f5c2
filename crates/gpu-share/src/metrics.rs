//! Counters for conditions the scheduler tolerates but operators should see.
//!
//! Events are additionally emitted under the `metrics.gpu_share` tracing
//! target so deployments can route them to a dedicated sink.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

const METRICS_TARGET: &str = "metrics.gpu_share";

#[derive(Debug, Default)]
pub struct SharingMetrics {
    unknown_device_skips: AtomicU64,
    accounting_underflows: AtomicU64,
    handshake_expirations: AtomicU64,
    lock_contentions: AtomicU64,
    allocations: AtomicU64,
    releases: AtomicU64,
}

impl SharingMetrics {
    /// A pod's allocation record referenced a device UUID absent from the
    /// pool. Transient control-plane/node inconsistency, skipped but counted.
    pub fn record_unknown_device(&self) {
        let total = self.unknown_device_skips.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(target: METRICS_TARGET, counter = "unknown_device_skips", value = total);
    }

    /// An accounting decrement would have gone below zero and was clamped.
    pub fn record_accounting_underflow(&self) {
        let total = self.accounting_underflows.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(target: METRICS_TARGET, counter = "accounting_underflows", value = total);
    }

    /// A node advertisement was retired because its handshake expired.
    pub fn record_handshake_expiration(&self) {
        let total = self.handshake_expirations.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(target: METRICS_TARGET, counter = "handshake_expirations", value = total);
    }

    pub fn record_lock_contention(&self) {
        let total = self.lock_contentions.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(target: METRICS_TARGET, counter = "lock_contentions", value = total);
    }

    pub fn record_allocation(&self) {
        let total = self.allocations.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(target: METRICS_TARGET, counter = "allocations", value = total);
    }

    pub fn record_release(&self) {
        let total = self.releases.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(target: METRICS_TARGET, counter = "releases", value = total);
    }

    pub fn unknown_device_skips(&self) -> u64 {
        self.unknown_device_skips.load(Ordering::Relaxed)
    }

    pub fn accounting_underflows(&self) -> u64 {
        self.accounting_underflows.load(Ordering::Relaxed)
    }

    pub fn handshake_expirations(&self) -> u64 {
        self.handshake_expirations.load(Ordering::Relaxed)
    }

    pub fn lock_contentions(&self) -> u64 {
        self.lock_contentions.load(Ordering::Relaxed)
    }

    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::Relaxed)
    }
}
