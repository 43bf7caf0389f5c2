//! Per-node device inventory and utilization accounting.
//!
//! A [`DevicePool`] is rebuilt wholesale from the node's inventory
//! annotation on every node-object change; only the per-pod accounting is
//! incremental, restored after a rebuild by replaying [`DevicePool::add_resource`]
//! over the pods bound to the node. The pool keeps an explicit reverse index
//! from pod to granted shares so every decrement exactly inverts the
//! increments that were actually applied, even across rebuilds where some
//! advertised devices disappeared.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use tracing::debug;
use tracing::warn;

use crate::codec;
use crate::codec::AllocationRecord;
use crate::codec::DeviceShare;
use crate::codec::DeviceSpec;
use crate::k8s::annotations::ASSIGNED_DEVICES_ANNOTATION;
use crate::k8s::annotations::pod_annotation;
use crate::metrics::SharingMetrics;

/// Compute-share capacity of every device, in percent.
pub const DEVICE_CORES_CAPACITY: u32 = 100;

/// `namespace/name` identity of a pod, the key of the holder index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl PodKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_pod(pod: &Pod) -> Self {
        Self {
            namespace: pod
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            name: pod.metadata.name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// One physical accelerator unit with its live utilization counters.
///
/// The counters are private: they move only through the pool's accounting
/// operations, which keep them consistent with the holder index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: u32,
    pub uuid: String,
    pub memory: u64,
    pub max_sharers: u32,
    pub device_type: String,
    pub healthy: bool,
    used_sharers: u32,
    used_memory: u64,
    used_cores: u32,
}

impl Device {
    fn from_spec(spec: DeviceSpec) -> Self {
        Self {
            id: spec.id,
            uuid: spec.uuid,
            memory: spec.memory,
            max_sharers: spec.max_sharers,
            device_type: spec.device_type,
            healthy: spec.healthy,
            used_sharers: 0,
            used_memory: 0,
            used_cores: 0,
        }
    }

    pub fn used_sharers(&self) -> u32 {
        self.used_sharers
    }

    pub fn used_memory(&self) -> u64 {
        self.used_memory
    }

    pub fn used_cores(&self) -> u32 {
        self.used_cores
    }
}

/// All shareable devices on one node, plus the accounting needed to answer
/// capacity queries during scheduling.
#[derive(Debug, Clone)]
pub struct DevicePool {
    node_name: String,
    devices: BTreeMap<u32, Device>,
    holders: HashMap<PodKey, Vec<DeviceShare>>,
    metrics: Arc<SharingMetrics>,
}

impl DevicePool {
    pub fn new(node_name: impl Into<String>, specs: Vec<DeviceSpec>, metrics: Arc<SharingMetrics>) -> Self {
        let devices = specs
            .into_iter()
            .map(|spec| (spec.id, Device::from_spec(spec)))
            .collect();
        Self {
            node_name: node_name.into(),
            devices,
            holders: HashMap::new(),
            metrics,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn device(&self, id: u32) -> Option<&Device> {
        self.devices.get(&id)
    }

    /// Whether the pod currently holds shares in this pool's accounting.
    pub fn holds(&self, key: &PodKey) -> bool {
        self.holders.contains_key(key)
    }

    /// Record a pod's persisted allocation into the utilization counters.
    ///
    /// No-op when the pod carries no (or a malformed) allocation record, and
    /// idempotent per pod so that replay after a pool rebuild cannot double
    /// count. Shares referencing a device UUID no longer present in the pool
    /// are skipped: a pod's binding can outlive any single inventory
    /// snapshot, so this is transient inconsistency, not an error.
    pub fn add_resource(&mut self, pod: &Pod) {
        let Some(value) = pod_annotation(pod, ASSIGNED_DEVICES_ANNOTATION) else {
            return;
        };
        let record = codec::decode_allocation(value);
        if record.is_empty() {
            return;
        }
        self.add_allocation(PodKey::from_pod(pod), &record);
    }

    /// Release the counters held by a pod: the exact inverse of
    /// [`DevicePool::add_resource`].
    pub fn sub_resource(&mut self, pod: &Pod) {
        let key = PodKey::from_pod(pod);
        let held = match self.holders.remove(&key) {
            Some(held) => held,
            // This process never saw the add (e.g. restart between the pool
            // rebuild and the pod replay); fall back to the durable record.
            None => {
                let Some(value) = pod_annotation(pod, ASSIGNED_DEVICES_ANNOTATION) else {
                    return;
                };
                codec::decode_allocation(value).shares().cloned().collect()
            }
        };
        for share in held {
            self.subtract_share(&key, &share);
        }
    }

    /// Apply an already-decoded allocation for `key`. Used by the allocate
    /// commit path, where the record was just persisted and re-decoding the
    /// pod object would be wasted work.
    pub fn add_allocation(&mut self, key: PodKey, record: &AllocationRecord) {
        if self.holders.contains_key(&key) {
            debug!(pod = %key, node = %self.node_name, "allocation already accounted, skipping");
            return;
        }
        let mut held = Vec::new();
        for share in record.shares() {
            match self.devices.values_mut().find(|dev| dev.uuid == share.uuid) {
                Some(device) => {
                    device.used_memory += share.memory;
                    device.used_cores += share.cores;
                    device.used_sharers += 1;
                    held.push(share.clone());
                }
                None => {
                    warn!(
                        pod = %key,
                        node = %self.node_name,
                        uuid = %share.uuid,
                        "allocation references a device absent from the pool"
                    );
                    self.metrics.record_unknown_device();
                }
            }
        }
        self.holders.insert(key, held);
    }

    fn subtract_share(&mut self, key: &PodKey, share: &DeviceShare) {
        let Some(device) = self.devices.values_mut().find(|dev| dev.uuid == share.uuid) else {
            self.metrics.record_unknown_device();
            return;
        };
        let mut underflow = false;
        device.used_memory = match device.used_memory.checked_sub(share.memory) {
            Some(v) => v,
            None => {
                underflow = true;
                0
            }
        };
        device.used_cores = match device.used_cores.checked_sub(share.cores) {
            Some(v) => v,
            None => {
                underflow = true;
                0
            }
        };
        device.used_sharers = match device.used_sharers.checked_sub(1) {
            Some(v) => v,
            None => {
                underflow = true;
                0
            }
        };
        if underflow {
            warn!(
                pod = %key,
                node = %self.node_name,
                uuid = %share.uuid,
                "accounting underflow, counters clamped to zero"
            );
            self.metrics.record_accounting_underflow();
        }
    }
}
