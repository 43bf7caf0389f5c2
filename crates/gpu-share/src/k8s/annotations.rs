//! Annotation keys and resource names of the sharing scheme, plus request
//! extraction from pod objects.

use error_stack::Report;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::decision::ContainerRequest;
use crate::decision::DeviceRequest;
use crate::error::DeviceError;

/// Node-scoped: encoded device inventory advertised by the node agent.
pub const NODE_REGISTER_ANNOTATION: &str = "gpu-share.io/node-device-register";
/// Node-scoped: liveness handshake value, see [`crate::handshake`].
pub const NODE_HANDSHAKE_ANNOTATION: &str = "gpu-share.io/node-handshake";
/// Node-scoped: distributed allocation lock stamp.
pub const NODE_LOCK_ANNOTATION: &str = "gpu-share.io/mutex-lock";

/// Pod-scoped: encoded allocation record, the durable scheduling decision.
pub const ASSIGNED_DEVICES_ANNOTATION: &str = "gpu-share.io/assigned-devices";
/// Pod-scoped: copy of the record consumed by the node agent's bind loop.
pub const DEVICES_TO_ALLOCATE_ANNOTATION: &str = "gpu-share.io/devices-to-allocate";
/// Pod-scoped: name of the node the decision was made for.
pub const ASSIGNED_NODE_ANNOTATION: &str = "gpu-share.io/assigned-node";
/// Pod-scoped: unix timestamp of the scheduling decision.
pub const ASSIGNED_TIME_ANNOTATION: &str = "gpu-share.io/assigned-time";
/// Pod-scoped: bind-phase marker for the node agent.
pub const BIND_PHASE_ANNOTATION: &str = "gpu-share.io/bind-phase";
/// Pod-scoped: unix timestamp of the bind-phase transition.
pub const BIND_TIME_ANNOTATION: &str = "gpu-share.io/bind-time";
/// Pod-scoped: comma-separated card types the pod accepts.
pub const DEVICE_TYPE_ANNOTATION: &str = "gpu-share.io/use-gpu-type";

/// Bind phase written by a successful allocation.
pub const BIND_PHASE_ALLOCATING: &str = "allocating";

/// Container resource limit: number of shared devices.
pub const DEVICE_NUMBER_RESOURCE: &str = "gpu-share.io/gpu-number";
/// Container resource limit: device memory per device, in memory units.
pub const DEVICE_MEMORY_RESOURCE: &str = "gpu-share.io/gpu-memory";
/// Container resource limit: compute share per device, in percent.
pub const DEVICE_CORES_RESOURCE: &str = "gpu-share.io/gpu-cores";

/// Resource names the outer framework must exclude from ordinary
/// node-capacity accounting; they are bookkept by this subsystem instead.
pub const IGNORED_DEVICE_RESOURCES: &[&str] = &[
    DEVICE_NUMBER_RESOURCE,
    DEVICE_MEMORY_RESOURCE,
    DEVICE_CORES_RESOURCE,
];

pub fn pod_annotation<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .annotations
        .as_ref()?
        .get(key)
        .map(String::as_str)
}

/// Whether the pod references the sharing scheme at all. A pure presence
/// probe; malformed values are the business of [`container_requests`].
pub fn requests_sharing(pod: &Pod) -> bool {
    let Some(spec) = &pod.spec else {
        return false;
    };
    spec.containers.iter().any(|container| {
        container
            .resources
            .as_ref()
            .and_then(|resources| resources.limits.as_ref())
            .is_some_and(|limits| limits.contains_key(DEVICE_NUMBER_RESOURCE))
    })
}

/// Extract the pod's device request from its container resource limits.
///
/// Containers without a device-number limit (or with an explicit zero) are
/// skipped. Memory and compute-share limits default to zero, meaning
/// "no constraint on that dimension".
///
/// # Errors
///
/// - [`DeviceError::InvalidRequest`] if a declared limit is not numeric
pub fn container_requests(pod: &Pod) -> Result<DeviceRequest, Report<DeviceError>> {
    let mut containers = Vec::new();
    if let Some(spec) = &pod.spec {
        for container in &spec.containers {
            let Some(limits) = container
                .resources
                .as_ref()
                .and_then(|resources| resources.limits.as_ref())
            else {
                continue;
            };
            let Some(units) = limits.get(DEVICE_NUMBER_RESOURCE) else {
                continue;
            };
            let units: u32 = parse_quantity(units, &container.name, DEVICE_NUMBER_RESOURCE)?;
            if units == 0 {
                continue;
            }
            let memory = match limits.get(DEVICE_MEMORY_RESOURCE) {
                Some(quantity) => parse_quantity(quantity, &container.name, DEVICE_MEMORY_RESOURCE)?,
                None => 0,
            };
            let cores = match limits.get(DEVICE_CORES_RESOURCE) {
                Some(quantity) => parse_quantity(quantity, &container.name, DEVICE_CORES_RESOURCE)?,
                None => 0,
            };
            containers.push(ContainerRequest {
                units,
                memory,
                cores,
            });
        }
    }
    Ok(DeviceRequest {
        containers,
        type_selector: type_selector(pod),
    })
}

fn type_selector(pod: &Pod) -> Option<Vec<String>> {
    let selector: Vec<String> = pod_annotation(pod, DEVICE_TYPE_ANNOTATION)?
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect();
    if selector.is_empty() {
        None
    } else {
        Some(selector)
    }
}

fn parse_quantity<T: std::str::FromStr>(
    quantity: &Quantity,
    container: &str,
    resource: &str,
) -> Result<T, Report<DeviceError>> {
    quantity.0.trim().parse().map_err(|_| {
        Report::new(DeviceError::InvalidRequest {
            message: format!(
                "container {container}: {resource} must be a plain number, got {:?}",
                quantity.0
            ),
        })
    })
}
