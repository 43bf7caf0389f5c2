mod codec;
mod config;
mod decision;
mod error;
mod handshake;
pub mod k8s;
pub mod logging;
mod metrics;
mod plugin;
mod pool;
mod registry;

// Re-export the surface the scheduling framework wires against.
pub use codec::decode_allocation;
pub use codec::decode_node_devices;
pub use codec::encode_allocation;
pub use codec::encode_node_devices;
pub use codec::AllocationRecord;
pub use codec::DeviceShare;
pub use codec::DeviceSpec;
pub use config::SharingConfig;
pub use decision::decide;
pub use decision::ContainerRequest;
pub use decision::DeviceRequest;
pub use error::DeviceError;
pub use handshake::HandshakeState;
pub use metrics::SharingMetrics;
pub use plugin::DeviceSharing;
pub use plugin::FilterStatus;
pub use plugin::SharedDevices;
pub use pool::Device;
pub use pool::DevicePool;
pub use pool::PodKey;
pub use registry::NodeRegistry;
