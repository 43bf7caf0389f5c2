//! The four operations exposed to the scheduling framework: capability
//! probe, feasibility filter, allocate, release.
//!
//! Filter runs lock-free against the current pool snapshot; a stale verdict
//! is corrected by allocate, which re-decides while holding the per-node
//! serialization (an in-process keyed mutex, plus the distributed node lock
//! when enabled). The commit order is decide, persist, account: in-memory
//! counters move only after the annotation patch succeeded, so a failed
//! patch leaves the orchestration-visible state and the accounting equally
//! untouched.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Pod;
use tokio::sync::Mutex;
use tracing::info;
use tracing::warn;

use crate::codec;
use crate::config::SharingConfig;
use crate::decision;
use crate::decision::DeviceRequest;
use crate::error::DeviceError;
use crate::k8s::annotations::container_requests;
use crate::k8s::annotations::pod_annotation;
use crate::k8s::annotations::requests_sharing;
use crate::k8s::annotations::ASSIGNED_DEVICES_ANNOTATION;
use crate::k8s::annotations::ASSIGNED_NODE_ANNOTATION;
use crate::k8s::annotations::ASSIGNED_TIME_ANNOTATION;
use crate::k8s::annotations::BIND_PHASE_ALLOCATING;
use crate::k8s::annotations::BIND_PHASE_ANNOTATION;
use crate::k8s::annotations::BIND_TIME_ANNOTATION;
use crate::k8s::annotations::DEVICES_TO_ALLOCATE_ANNOTATION;
use crate::k8s::annotations::IGNORED_DEVICE_RESOURCES;
use crate::k8s::node_lock;
use crate::k8s::patcher::AnnotationChanges;
use crate::k8s::patcher::AnnotationPatcher;
use crate::metrics::SharingMetrics;
use crate::pool::PodKey;
use crate::registry::NodeRegistry;

/// Verdict of the feasibility filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterStatus {
    Success,
    Unschedulable { reason: String },
}

/// The surface this subsystem exposes to the scheduling framework.
#[async_trait]
pub trait SharedDevices: Send + Sync {
    /// Whether the pod references the sharing scheme at all. Pure.
    fn has_device_request(&self, pod: &Pod) -> bool;

    /// Resource names the framework must exclude from ordinary
    /// node-capacity accounting.
    fn ignored_resources(&self) -> &'static [&'static str];

    /// Feasibility check against the node's current pool snapshot. Never
    /// mutates the pool and takes no lock.
    fn filter_node(&self, pod: &Pod, node_name: &str)
        -> Result<FilterStatus, Report<DeviceError>>;

    /// Decide, persist and account an assignment for the pod on the node.
    async fn allocate(&self, pod: &Pod, node_name: &str) -> Result<(), Report<DeviceError>>;

    /// Inverse of allocate: clear the persisted assignment and reclaim the
    /// in-memory capacity.
    async fn release(&self, pod: &Pod, node_name: &str) -> Result<(), Report<DeviceError>>;
}

/// Device-sharing integration over a pool registry and an annotation
/// persistence backend.
pub struct DeviceSharing<P: AnnotationPatcher> {
    config: SharingConfig,
    patcher: Arc<P>,
    registry: Arc<NodeRegistry<P>>,
    metrics: Arc<SharingMetrics>,
    // Serializes allocate/release per node within this process. The node
    // set is small and bounded, so entries are simply kept.
    node_mutexes: DashMap<String, Arc<Mutex<()>>>,
}

impl<P: AnnotationPatcher> DeviceSharing<P> {
    pub fn new(config: SharingConfig, patcher: Arc<P>) -> Self {
        let metrics = Arc::new(SharingMetrics::default());
        let registry = Arc::new(NodeRegistry::new(
            config.clone(),
            Arc::clone(&patcher),
            Arc::clone(&metrics),
        ));
        Self {
            config,
            patcher,
            registry,
            metrics,
            node_mutexes: DashMap::new(),
        }
    }

    /// The pool registry, for wiring node/pod event handlers.
    pub fn registry(&self) -> &Arc<NodeRegistry<P>> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<SharingMetrics> {
        &self.metrics
    }

    fn node_mutex(&self, node_name: &str) -> Arc<Mutex<()>> {
        self.node_mutexes
            .entry(node_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn allocate_under_lock(
        &self,
        key: &PodKey,
        request: &DeviceRequest,
        node_name: &str,
    ) -> Result<(), Report<DeviceError>> {
        // Re-decide under the lock; the filter-time snapshot may be stale.
        let record = self
            .registry
            .with_pool(node_name, |pool| decision::decide(request, pool, false))
            .ok_or_else(|| {
                Report::new(DeviceError::PoolNotFound {
                    node: node_name.to_string(),
                })
            })?
            .map_err(Report::new)?
            .unwrap_or_default();

        let encoded = codec::encode_allocation(&record);
        let now_unix = Utc::now().timestamp().to_string();
        let mut changes = AnnotationChanges::new();
        changes.insert(ASSIGNED_DEVICES_ANNOTATION.to_string(), Some(encoded.clone()));
        changes.insert(DEVICES_TO_ALLOCATE_ANNOTATION.to_string(), Some(encoded));
        changes.insert(ASSIGNED_NODE_ANNOTATION.to_string(), Some(node_name.to_string()));
        changes.insert(ASSIGNED_TIME_ANNOTATION.to_string(), Some(now_unix.clone()));
        changes.insert(
            BIND_PHASE_ANNOTATION.to_string(),
            Some(BIND_PHASE_ALLOCATING.to_string()),
        );
        changes.insert(BIND_TIME_ANNOTATION.to_string(), Some(now_unix));

        self.patcher
            .patch_pod_annotations(key, changes)
            .await
            .change_context(DeviceError::PersistenceFailure {
                message: format!("writing assignment for pod {key}"),
            })?;

        // Persisted; make the reduced capacity visible to later cycles in
        // this process ahead of the next pool rebuild.
        self.registry
            .with_pool_mut(node_name, |pool| pool.add_allocation(key.clone(), &record));
        self.metrics.record_allocation();
        info!(pod = %key, node = node_name, "device allocation committed");
        Ok(())
    }
}

#[async_trait]
impl<P: AnnotationPatcher + 'static> SharedDevices for DeviceSharing<P> {
    fn has_device_request(&self, pod: &Pod) -> bool {
        self.config.sharing_enabled && requests_sharing(pod)
    }

    fn ignored_resources(&self) -> &'static [&'static str] {
        IGNORED_DEVICE_RESOURCES
    }

    #[tracing::instrument(skip_all, fields(node = node_name))]
    fn filter_node(
        &self,
        pod: &Pod,
        node_name: &str,
    ) -> Result<FilterStatus, Report<DeviceError>> {
        if !self.config.sharing_enabled {
            return Ok(FilterStatus::Success);
        }
        let request = match container_requests(pod) {
            Ok(request) => request,
            Err(report) => {
                return Ok(FilterStatus::Unschedulable {
                    reason: report.current_context().to_string(),
                })
            }
        };
        if request.is_empty() {
            return Ok(FilterStatus::Success);
        }
        match self
            .registry
            .with_pool(node_name, |pool| decision::decide(&request, pool, true))
        {
            None => Ok(FilterStatus::Unschedulable {
                reason: format!("node {node_name} has no shareable devices"),
            }),
            Some(Err(err @ DeviceError::Infeasible { .. })) => Ok(FilterStatus::Unschedulable {
                reason: err.to_string(),
            }),
            Some(Err(other)) => Err(Report::new(other)),
            Some(Ok(_)) => Ok(FilterStatus::Success),
        }
    }

    #[tracing::instrument(skip_all, fields(node = node_name))]
    async fn allocate(&self, pod: &Pod, node_name: &str) -> Result<(), Report<DeviceError>> {
        if !self.config.sharing_enabled {
            return Ok(());
        }
        let request = container_requests(pod)?;
        if request.is_empty() {
            return Ok(());
        }
        let key = PodKey::from_pod(pod);

        let mutex = self.node_mutex(node_name);
        let _guard = mutex.lock().await;

        let mut holds_node_lock = false;
        if self.config.node_lock_enabled {
            if let Err(report) = node_lock::lock_node(
                self.patcher.as_ref(),
                node_name,
                self.config.node_lock_expiry(),
            )
            .await
            {
                self.metrics.record_lock_contention();
                return Err(report);
            }
            holds_node_lock = true;
        }

        let result = self.allocate_under_lock(&key, &request, node_name).await;

        if holds_node_lock {
            if let Err(report) = node_lock::unlock_node(self.patcher.as_ref(), node_name).await {
                warn!(
                    node = node_name,
                    error = ?report,
                    "failed to release node lock; the expiry will reclaim it"
                );
            }
        }
        result
    }

    #[tracing::instrument(skip_all, fields(node = node_name))]
    async fn release(&self, pod: &Pod, node_name: &str) -> Result<(), Report<DeviceError>> {
        if !self.config.sharing_enabled {
            return Ok(());
        }
        let key = PodKey::from_pod(pod);
        let tracked = self
            .registry
            .with_pool(node_name, |pool| pool.holds(&key))
            .unwrap_or(false);
        if !tracked && pod_annotation(pod, ASSIGNED_DEVICES_ANNOTATION).is_none() {
            return Ok(());
        }

        let mutex = self.node_mutex(node_name);
        let _guard = mutex.lock().await;

        let mut changes = AnnotationChanges::new();
        for annotation in [
            ASSIGNED_DEVICES_ANNOTATION,
            DEVICES_TO_ALLOCATE_ANNOTATION,
            ASSIGNED_NODE_ANNOTATION,
            ASSIGNED_TIME_ANNOTATION,
            BIND_PHASE_ANNOTATION,
            BIND_TIME_ANNOTATION,
        ] {
            changes.insert(annotation.to_string(), None);
        }
        self.patcher
            .patch_pod_annotations(&key, changes)
            .await
            .change_context(DeviceError::PersistenceFailure {
                message: format!("clearing assignment for pod {key}"),
            })?;

        self.registry
            .with_pool_mut(node_name, |pool| pool.sub_resource(pod));
        self.metrics.record_release();
        info!(pod = %key, node = node_name, "device allocation released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex as StdMutex;

    use k8s_openapi::api::core::v1::Container;
    use k8s_openapi::api::core::v1::Node;
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::api::core::v1::ResourceRequirements;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;
    use crate::codec::encode_node_devices;
    use crate::codec::DeviceSpec;
    use crate::k8s::annotations::DEVICE_MEMORY_RESOURCE;
    use crate::k8s::annotations::DEVICE_NUMBER_RESOURCE;
    use crate::k8s::annotations::NODE_HANDSHAKE_ANNOTATION;
    use crate::k8s::annotations::NODE_LOCK_ANNOTATION;
    use crate::k8s::annotations::NODE_REGISTER_ANNOTATION;
    use crate::k8s::types::KubernetesError;

    /// Records pod patches, applies node patches to an in-memory node store,
    /// and can be told to fail pod patches.
    #[derive(Default)]
    struct MockPatcher {
        node_annotations: StdMutex<BTreeMap<String, String>>,
        pod_patches: StdMutex<Vec<(PodKey, AnnotationChanges)>>,
        fail_pod_patch: AtomicBool,
    }

    #[async_trait]
    impl AnnotationPatcher for MockPatcher {
        async fn patch_pod_annotations(
            &self,
            pod: &PodKey,
            changes: AnnotationChanges,
        ) -> Result<(), Report<KubernetesError>> {
            if self.fail_pod_patch.load(Ordering::SeqCst) {
                return Err(Report::new(KubernetesError::PatchFailed {
                    message: "injected failure".to_string(),
                }));
            }
            self.pod_patches.lock().unwrap().push((pod.clone(), changes));
            Ok(())
        }

        async fn patch_node_annotations(
            &self,
            _node: &str,
            changes: AnnotationChanges,
        ) -> Result<(), Report<KubernetesError>> {
            let mut annotations = self.node_annotations.lock().unwrap();
            for (key, value) in changes {
                match value {
                    Some(value) => annotations.insert(key, value),
                    None => annotations.remove(&key),
                };
            }
            Ok(())
        }

        async fn node_annotations(
            &self,
            _node: &str,
        ) -> Result<BTreeMap<String, String>, Report<KubernetesError>> {
            Ok(self.node_annotations.lock().unwrap().clone())
        }
    }

    fn sharing_node(name: &str, devices: &[(u32, &str, u64, u32)]) -> Node {
        let specs: Vec<DeviceSpec> = devices
            .iter()
            .map(|(id, uuid, memory, max_sharers)| DeviceSpec {
                id: *id,
                uuid: uuid.to_string(),
                memory: *memory,
                max_sharers: *max_sharers,
                device_type: "A100".to_string(),
                healthy: true,
            })
            .collect();
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: Some(BTreeMap::from([
                    (NODE_REGISTER_ANNOTATION.to_string(), encode_node_devices(&specs)),
                    (NODE_HANDSHAKE_ANNOTATION.to_string(), "Confirmed".to_string()),
                ])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn requesting_pod(name: &str, memory: u64) -> Pod {
        let limits = BTreeMap::from([
            (DEVICE_NUMBER_RESOURCE.to_string(), Quantity("1".to_string())),
            (DEVICE_MEMORY_RESOURCE.to_string(), Quantity(memory.to_string())),
        ]);
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "main".to_string(),
                    resources: Some(ResourceRequirements {
                        limits: Some(limits),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn sharing_with_node(
        config: SharingConfig,
        devices: &[(u32, &str, u64, u32)],
    ) -> (DeviceSharing<MockPatcher>, Arc<MockPatcher>) {
        let patcher = Arc::new(MockPatcher::default());
        let sharing = DeviceSharing::new(config, Arc::clone(&patcher));
        sharing
            .registry()
            .observe_node(&sharing_node("node-a", devices), &[])
            .await;
        (sharing, patcher)
    }

    #[test_log::test(tokio::test)]
    async fn filter_then_allocate_then_filter_scenario() {
        // One device, memory 8, two sharer slots.
        let (sharing, patcher) =
            sharing_with_node(SharingConfig::default(), &[(0, "GPU-aaaa", 8, 2)]).await;
        let pod_a = requesting_pod("pod-a", 4);

        assert_eq!(
            sharing.filter_node(&pod_a, "node-a").unwrap(),
            FilterStatus::Success
        );
        sharing.allocate(&pod_a, "node-a").await.unwrap();

        let (device_memory, device_sharers) = sharing
            .registry()
            .with_pool("node-a", |pool| {
                let device = pool.device(0).unwrap();
                (device.used_memory(), device.used_sharers())
            })
            .unwrap();
        assert_eq!(device_memory, 4);
        assert_eq!(device_sharers, 1);

        let patches = patcher.pod_patches.lock().unwrap();
        assert_eq!(patches.len(), 1);
        let (key, changes) = &patches[0];
        assert_eq!(key, &PodKey::new("default", "pod-a"));
        assert_eq!(
            changes.get(ASSIGNED_DEVICES_ANNOTATION).unwrap().as_deref(),
            Some("GPU-aaaa,4,0")
        );
        assert_eq!(
            changes.get(ASSIGNED_NODE_ANNOTATION).unwrap().as_deref(),
            Some("node-a")
        );
        assert_eq!(
            changes.get(BIND_PHASE_ANNOTATION).unwrap().as_deref(),
            Some(BIND_PHASE_ALLOCATING)
        );
        drop(patches);

        // Remaining memory is 4: a 5-unit request no longer fits.
        let pod_b = requesting_pod("pod-b", 5);
        assert!(matches!(
            sharing.filter_node(&pod_b, "node-a").unwrap(),
            FilterStatus::Unschedulable { .. }
        ));
    }

    #[tokio::test]
    async fn filter_never_mutates_the_pool() {
        let (sharing, _patcher) =
            sharing_with_node(SharingConfig::default(), &[(0, "GPU-aaaa", 8, 2)]).await;
        let before = sharing
            .registry()
            .with_pool("node-a", |pool| pool.device(0).unwrap().clone())
            .unwrap();

        let _ = sharing.filter_node(&requesting_pod("pod-a", 4), "node-a");
        let _ = sharing.filter_node(&requesting_pod("pod-b", 100), "node-a");

        let after = sharing
            .registry()
            .with_pool("node-a", |pool| pool.device(0).unwrap().clone())
            .unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn allocate_on_unknown_node_fails() {
        let (sharing, _patcher) =
            sharing_with_node(SharingConfig::default(), &[(0, "GPU-aaaa", 8, 2)]).await;
        let err = sharing
            .allocate(&requesting_pod("pod-a", 4), "node-z")
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            DeviceError::PoolNotFound { .. }
        ));
    }

    #[test_log::test(tokio::test)]
    async fn allocate_patch_failure_leaves_accounting_untouched() {
        let config = SharingConfig {
            node_lock_enabled: true,
            ..Default::default()
        };
        let (sharing, patcher) = sharing_with_node(config, &[(0, "GPU-aaaa", 8, 2)]).await;
        patcher.fail_pod_patch.store(true, Ordering::SeqCst);

        let err = sharing
            .allocate(&requesting_pod("pod-a", 4), "node-a")
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            DeviceError::PersistenceFailure { .. }
        ));

        let used = sharing
            .registry()
            .with_pool("node-a", |pool| pool.device(0).unwrap().used_memory())
            .unwrap();
        assert_eq!(used, 0);
        // The distributed lock must have been released on the failure path.
        assert!(!patcher
            .node_annotations
            .lock()
            .unwrap()
            .contains_key(NODE_LOCK_ANNOTATION));
    }

    #[tokio::test]
    async fn allocate_respects_live_node_lock() {
        let config = SharingConfig {
            node_lock_enabled: true,
            ..Default::default()
        };
        let (sharing, patcher) = sharing_with_node(config, &[(0, "GPU-aaaa", 8, 2)]).await;
        patcher.node_annotations.lock().unwrap().insert(
            NODE_LOCK_ANNOTATION.to_string(),
            Utc::now().to_rfc3339(),
        );

        let err = sharing
            .allocate(&requesting_pod("pod-a", 4), "node-a")
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            DeviceError::LockUnavailable { .. }
        ));
        assert!(patcher.pod_patches.lock().unwrap().is_empty());
        assert_eq!(sharing.metrics().lock_contentions(), 1);
    }

    #[tokio::test]
    async fn release_reclaims_capacity_and_clears_assignment() {
        let (sharing, patcher) =
            sharing_with_node(SharingConfig::default(), &[(0, "GPU-aaaa", 8, 2)]).await;
        let pod = requesting_pod("pod-a", 4);
        sharing.allocate(&pod, "node-a").await.unwrap();

        sharing.release(&pod, "node-a").await.unwrap();

        let used = sharing
            .registry()
            .with_pool("node-a", |pool| pool.device(0).unwrap().used_memory())
            .unwrap();
        assert_eq!(used, 0);

        let patches = patcher.pod_patches.lock().unwrap();
        let (_, changes) = patches.last().unwrap();
        assert_eq!(changes.get(ASSIGNED_DEVICES_ANNOTATION).unwrap(), &None);
        assert_eq!(changes.get(ASSIGNED_NODE_ANNOTATION).unwrap(), &None);
    }

    #[tokio::test]
    async fn release_of_unallocated_pod_is_a_noop() {
        let (sharing, patcher) =
            sharing_with_node(SharingConfig::default(), &[(0, "GPU-aaaa", 8, 2)]).await;
        sharing
            .release(&requesting_pod("pod-a", 4), "node-a")
            .await
            .unwrap();
        assert!(patcher.pod_patches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn disabled_sharing_is_inert() {
        let config = SharingConfig {
            sharing_enabled: false,
            ..Default::default()
        };
        let (sharing, patcher) = sharing_with_node(config, &[(0, "GPU-aaaa", 8, 2)]).await;
        let pod = requesting_pod("pod-a", 4);

        assert!(!sharing.has_device_request(&pod));
        assert_eq!(
            sharing.filter_node(&pod, "node-a").unwrap(),
            FilterStatus::Success
        );
        sharing.allocate(&pod, "node-a").await.unwrap();
        assert!(patcher.pod_patches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn capability_probe_checks_resources() {
        let (sharing, _patcher) =
            sharing_with_node(SharingConfig::default(), &[(0, "GPU-aaaa", 8, 2)]).await;
        assert!(sharing.has_device_request(&requesting_pod("pod-a", 4)));

        let plain = Pod {
            metadata: ObjectMeta {
                name: Some("plain".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(!sharing.has_device_request(&plain));
        assert_eq!(
            sharing.filter_node(&plain, "node-a").unwrap(),
            FilterStatus::Success
        );
    }

    #[tokio::test]
    async fn invalid_request_is_unschedulable_at_filter() {
        let (sharing, _patcher) =
            sharing_with_node(SharingConfig::default(), &[(0, "GPU-aaaa", 8, 2)]).await;
        let mut pod = requesting_pod("pod-a", 4);
        if let Some(spec) = pod.spec.as_mut() {
            if let Some(resources) = spec.containers[0].resources.as_mut() {
                resources.limits.as_mut().unwrap().insert(
                    DEVICE_NUMBER_RESOURCE.to_string(),
                    Quantity("one".to_string()),
                );
            }
        }
        assert!(matches!(
            sharing.filter_node(&pod, "node-a").unwrap(),
            FilterStatus::Unschedulable { .. }
        ));
    }
}
