//! Feasibility and placement decisions over a device pool.
//!
//! `decide` is pure: it never mutates the pool. The allocate path commits
//! its returned assignment only after the record has been persisted, so a
//! failed patch leaves no trace in the accounting.

use std::collections::BTreeMap;

use crate::codec::AllocationRecord;
use crate::codec::DeviceShare;
use crate::error::DeviceError;
use crate::pool::DevicePool;
use crate::pool::DEVICE_CORES_CAPACITY;

/// One container's share of the pod request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRequest {
    /// Number of distinct devices the container needs.
    pub units: u32,
    /// Memory per device, in the advertised memory units.
    pub memory: u64,
    /// Compute share per device, in percent.
    pub cores: u32,
}

/// A pod's full device request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceRequest {
    pub containers: Vec<ContainerRequest>,
    /// Card types the pod accepts; `None` accepts any.
    pub type_selector: Option<Vec<String>>,
}

impl DeviceRequest {
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }
}

/// Capacity already promised to earlier containers of the same pod while the
/// decision is being assembled.
#[derive(Debug, Default, Clone, Copy)]
struct PendingUse {
    memory: u64,
    cores: u32,
    sharers: u32,
}

/// Decide whether `request` fits on `pool` and, unless `filter_only`, which
/// concrete shares to bind.
///
/// Candidates must be healthy, match the type selector, and have spare
/// memory, spare compute share and a free sharer slot. Among them the
/// best-fit wins: least memory left over after placement, ties broken by
/// ascending device id so concurrent schedulers converge on the same choice.
///
/// # Errors
///
/// - [`DeviceError::Infeasible`] when any container cannot be placed
pub fn decide(
    request: &DeviceRequest,
    pool: &DevicePool,
    filter_only: bool,
) -> Result<Option<AllocationRecord>, DeviceError> {
    let mut pending: BTreeMap<u32, PendingUse> = BTreeMap::new();
    let mut containers = Vec::with_capacity(request.containers.len());

    for (index, container) in request.containers.iter().enumerate() {
        // (leftover memory, id, uuid) — tuple order is the packing policy.
        let mut candidates: Vec<(u64, u32, &str)> = Vec::new();
        for device in pool.devices() {
            let extra = pending.get(&device.id).copied().unwrap_or_default();
            if !device.healthy {
                continue;
            }
            if let Some(types) = &request.type_selector {
                if !types.iter().any(|wanted| *wanted == device.device_type) {
                    continue;
                }
            }
            let used_memory = device.used_memory() + extra.memory;
            if used_memory + container.memory > device.memory {
                continue;
            }
            let used_cores = device.used_cores() + extra.cores;
            if used_cores + container.cores > DEVICE_CORES_CAPACITY {
                continue;
            }
            if device.used_sharers() + extra.sharers >= device.max_sharers {
                continue;
            }
            let leftover = device.memory - used_memory - container.memory;
            candidates.push((leftover, device.id, device.uuid.as_str()));
        }

        if (candidates.len() as u32) < container.units {
            return Err(DeviceError::Infeasible {
                reason: format!(
                    "container {index}: {} of {} requested device(s) available on {}",
                    candidates.len(),
                    container.units,
                    pool.node_name()
                ),
            });
        }
        candidates.sort();

        let mut assigned = Vec::with_capacity(container.units as usize);
        for (_, id, uuid) in candidates.into_iter().take(container.units as usize) {
            let entry = pending.entry(id).or_default();
            entry.memory += container.memory;
            entry.cores += container.cores;
            entry.sharers += 1;
            assigned.push(DeviceShare {
                uuid: uuid.to_string(),
                memory: container.memory,
                cores: container.cores,
            });
        }
        containers.push(assigned);
    }

    if filter_only {
        Ok(None)
    } else {
        Ok(Some(AllocationRecord(containers)))
    }
}
