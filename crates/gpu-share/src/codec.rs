//! Compact string codecs for the node inventory and pod allocation
//! annotations.
//!
//! Node inventory: one `id,uuid,memory,max_sharers,type,health` segment per
//! device, `:`-joined with a trailing `:`. Pod allocation record: containers
//! `;`-joined, devices within a container `:`-joined, each device a
//! `uuid,memory,cores` triple. Decoding fails soft: malformed segments are
//! skipped and an absent or garbled value decodes to the empty record, so a
//! bad annotation can never take the scheduler down.

use std::fmt;

/// One advertised accelerator unit, as carried by the node inventory
/// annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    /// Node-local device index.
    pub id: u32,
    /// Globally unique hardware identifier.
    pub uuid: String,
    /// Total device memory capacity, in the advertised memory units.
    pub memory: u64,
    /// Maximum number of pods that may share this device concurrently.
    pub max_sharers: u32,
    /// Card type tag, e.g. a product name.
    pub device_type: String,
    pub healthy: bool,
}

/// One granted share of a device: the persisted unit of an allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceShare {
    pub uuid: String,
    /// Memory granted to the holder, in the advertised memory units.
    pub memory: u64,
    /// Compute share granted to the holder, in percent of the device.
    pub cores: u32,
}

/// The encoded-annotation unit of persistence: per-container device
/// assignments, in container order. Immutable once written; a new allocation
/// fully replaces the prior value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AllocationRecord(pub Vec<Vec<DeviceShare>>);

impl AllocationRecord {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// All granted shares across containers, in encoding order.
    pub fn shares(&self) -> impl Iterator<Item = &DeviceShare> {
        self.0.iter().flatten()
    }
}

impl fmt::Display for AllocationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode_allocation(self))
    }
}

/// Encode a node's device inventory into its annotation value.
pub fn encode_node_devices(devices: &[DeviceSpec]) -> String {
    let mut out = String::new();
    for dev in devices {
        out.push_str(&format!(
            "{},{},{},{},{},{}:",
            dev.id, dev.uuid, dev.memory, dev.max_sharers, dev.device_type, dev.healthy
        ));
    }
    out
}

/// Decode a node inventory annotation value. Malformed segments are skipped.
pub fn decode_node_devices(value: &str) -> Vec<DeviceSpec> {
    let mut devices = Vec::new();
    for segment in value.split(':') {
        if !segment.contains(',') {
            continue;
        }
        let fields: Vec<&str> = segment.split(',').collect();
        if fields.len() != 6 {
            tracing::debug!(segment, "skipping malformed inventory segment");
            continue;
        }
        let parsed = (
            fields[0].parse::<u32>(),
            fields[2].parse::<u64>(),
            fields[3].parse::<u32>(),
            fields[5].parse::<bool>(),
        );
        match parsed {
            (Ok(id), Ok(memory), Ok(max_sharers), Ok(healthy)) => devices.push(DeviceSpec {
                id,
                uuid: fields[1].to_string(),
                memory,
                max_sharers,
                device_type: fields[4].to_string(),
                healthy,
            }),
            _ => tracing::debug!(segment, "skipping unparsable inventory segment"),
        }
    }
    devices
}

/// Encode an allocation record into its pod annotation value.
pub fn encode_allocation(record: &AllocationRecord) -> String {
    record
        .0
        .iter()
        .map(|container| {
            container
                .iter()
                .map(|share| format!("{},{},{}", share.uuid, share.memory, share.cores))
                .collect::<Vec<_>>()
                .join(":")
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// Decode a pod allocation annotation value. An empty or malformed value
/// decodes to the empty record; containers that decode to zero devices are
/// dropped so that `decode(encode(x)) == x` holds for every decodable value.
pub fn decode_allocation(value: &str) -> AllocationRecord {
    if value.is_empty() {
        return AllocationRecord::default();
    }
    let mut containers = Vec::new();
    for container_segment in value.split(';') {
        let mut shares = Vec::new();
        for device_segment in container_segment.split(':') {
            if !device_segment.contains(',') {
                continue;
            }
            let fields: Vec<&str> = device_segment.split(',').collect();
            if fields.len() != 3 {
                tracing::debug!(device_segment, "skipping malformed allocation segment");
                continue;
            }
            match (fields[1].parse::<u64>(), fields[2].parse::<u32>()) {
                (Ok(memory), Ok(cores)) => shares.push(DeviceShare {
                    uuid: fields[0].to_string(),
                    memory,
                    cores,
                }),
                _ => tracing::debug!(device_segment, "skipping unparsable allocation segment"),
            }
        }
        if !shares.is_empty() {
            containers.push(shares);
        }
    }
    AllocationRecord(containers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: u32, uuid: &str, memory: u64) -> DeviceSpec {
        DeviceSpec {
            id,
            uuid: uuid.to_string(),
            memory,
            max_sharers: 4,
            device_type: "A100".to_string(),
            healthy: true,
        }
    }

    fn share(uuid: &str, memory: u64, cores: u32) -> DeviceShare {
        DeviceShare {
            uuid: uuid.to_string(),
            memory,
            cores,
        }
    }

    #[test]
    fn node_devices_round_trip() {
        let devices = vec![spec(0, "GPU-aaaa", 8192), spec(1, "GPU-bbbb", 16384)];
        let encoded = encode_node_devices(&devices);
        assert_eq!(decode_node_devices(&encoded), devices);
    }

    #[test]
    fn node_devices_encoding_shape() {
        let encoded = encode_node_devices(&[spec(0, "GPU-aaaa", 8192)]);
        assert_eq!(encoded, "0,GPU-aaaa,8192,4,A100,true:");
    }

    #[test]
    fn node_devices_decode_skips_malformed_segments() {
        let devices =
            decode_node_devices("0,GPU-aaaa,8192,4,A100,true:not-a-device:1,GPU-bbbb,junk,4,A100,true:");
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].uuid, "GPU-aaaa");
    }

    #[test]
    fn node_devices_decode_empty_and_garbage() {
        assert!(decode_node_devices("").is_empty());
        assert!(decode_node_devices("garbage").is_empty());
    }

    #[test]
    fn allocation_round_trip() {
        let record = AllocationRecord(vec![
            vec![share("GPU-aaaa", 4096, 30)],
            vec![share("GPU-aaaa", 1024, 10), share("GPU-bbbb", 2048, 0)],
        ]);
        assert_eq!(decode_allocation(&encode_allocation(&record)), record);
    }

    #[test]
    fn allocation_encoding_shape() {
        let record = AllocationRecord(vec![
            vec![share("GPU-aaaa", 4096, 30)],
            vec![share("GPU-bbbb", 2048, 0)],
        ]);
        assert_eq!(encode_allocation(&record), "GPU-aaaa,4096,30;GPU-bbbb,2048,0");
    }

    #[test]
    fn allocation_empty_round_trip() {
        let record = AllocationRecord::default();
        assert_eq!(encode_allocation(&record), "");
        assert_eq!(decode_allocation(""), record);
    }

    #[test]
    fn allocation_decode_is_fail_soft() {
        assert!(decode_allocation("garbage").is_empty());
        assert!(decode_allocation(";;;").is_empty());
        let record = decode_allocation("GPU-aaaa,4096,30:bad;GPU-bbbb,oops,0");
        assert_eq!(record, AllocationRecord(vec![vec![share("GPU-aaaa", 4096, 30)]]));
    }

    #[test]
    fn decodable_values_round_trip() {
        for value in ["GPU-a,1,1", "GPU-a,1,1;GPU-b,2,2", "GPU-a,1,1:GPU-b,2,2;GPU-c,3,3"] {
            let decoded = decode_allocation(value);
            assert_eq!(decode_allocation(&encode_allocation(&decoded)), decoded);
        }
    }
}
