//! Node registration: turning observed node objects into device pools.
//!
//! Pools are rebuilt wholesale on every observation of a node object and the
//! per-pod accounting is restored by replaying the pods currently bound to
//! the node. Handshake patches are applied best-effort: a failed patch is
//! logged and retried naturally on the next node event rather than failing
//! the rebuild, because scheduling must keep running against the pool we
//! just decoded.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::codec;
use crate::config::SharingConfig;
use crate::handshake;
use crate::handshake::HandshakeAction;
use crate::handshake::HandshakeState;
use crate::k8s::annotations::pod_annotation;
use crate::k8s::annotations::ASSIGNED_NODE_ANNOTATION;
use crate::k8s::annotations::NODE_HANDSHAKE_ANNOTATION;
use crate::k8s::annotations::NODE_REGISTER_ANNOTATION;
use crate::k8s::patcher::AnnotationChanges;
use crate::k8s::patcher::AnnotationPatcher;
use crate::metrics::SharingMetrics;
use crate::pool::DevicePool;

/// Outcome of evaluating one node-annotation snapshot.
#[derive(Debug)]
pub(crate) struct BuildOutcome {
    pub pool: Option<DevicePool>,
    /// Handshake value to write back, if the snapshot calls for one.
    pub handshake_patch: Option<String>,
}

/// Pure core of node registration: decode the inventory and evaluate the
/// handshake against `now`. Device sharing is opt-in per node — a node
/// missing either annotation simply has no pool.
pub(crate) fn build_pool(
    name: &str,
    annotations: Option<&BTreeMap<String, String>>,
    now: DateTime<Utc>,
    config: &SharingConfig,
    metrics: &Arc<SharingMetrics>,
) -> BuildOutcome {
    let absent = BuildOutcome {
        pool: None,
        handshake_patch: None,
    };
    let Some(annotations) = annotations else {
        return absent;
    };
    let Some(inventory) = annotations.get(NODE_REGISTER_ANNOTATION) else {
        return absent;
    };
    let Some(handshake_value) = annotations.get(NODE_HANDSHAKE_ANNOTATION) else {
        return absent;
    };

    let specs = codec::decode_node_devices(inventory);
    if specs.is_empty() {
        debug!(node = name, "inventory annotation decodes to zero devices");
        return absent;
    }
    let pool = DevicePool::new(name, specs, Arc::clone(metrics));

    let state = HandshakeState::parse(handshake_value);
    match handshake::evaluate(&state, now, config.handshake_timeout()) {
        HandshakeAction::KeepPool => BuildOutcome {
            pool: Some(pool),
            handshake_patch: None,
        },
        HandshakeAction::KeepPoolAndPatch(value) => BuildOutcome {
            pool: Some(pool),
            handshake_patch: Some(value),
        },
        HandshakeAction::DropPool => BuildOutcome {
            pool: None,
            handshake_patch: None,
        },
        HandshakeAction::DropPoolAndPatch(value) => {
            info!(node = name, handshake = handshake_value, "device advertisement expired");
            metrics.record_handshake_expiration();
            BuildOutcome {
                pool: None,
                handshake_patch: Some(value),
            }
        }
    }
}

/// Shared-device pools for every participating node, rebuilt from node
/// events and consulted by the scheduling callbacks.
pub struct NodeRegistry<P: AnnotationPatcher> {
    pools: DashMap<String, DevicePool>,
    patcher: Arc<P>,
    config: SharingConfig,
    metrics: Arc<SharingMetrics>,
}

impl<P: AnnotationPatcher> NodeRegistry<P> {
    pub fn new(config: SharingConfig, patcher: Arc<P>, metrics: Arc<SharingMetrics>) -> Self {
        Self {
            pools: DashMap::new(),
            patcher,
            config,
            metrics,
        }
    }

    /// Rebuild the pool for `node` from its current object, replaying the
    /// accounting of `pods_on_node` (the pods the framework reports as bound
    /// to that node).
    pub async fn observe_node(&self, node: &Node, pods_on_node: &[Pod]) {
        let Some(name) = node.metadata.name.as_deref() else {
            return;
        };
        let outcome = build_pool(
            name,
            node.metadata.annotations.as_ref(),
            Utc::now(),
            &self.config,
            &self.metrics,
        );

        if let Some(value) = outcome.handshake_patch {
            let mut changes = AnnotationChanges::new();
            changes.insert(NODE_HANDSHAKE_ANNOTATION.to_string(), Some(value));
            if let Err(report) = self.patcher.patch_node_annotations(name, changes).await {
                warn!(node = name, error = ?report, "handshake patch failed; will retry on next node event");
            }
        }

        match outcome.pool {
            Some(mut pool) => {
                for pod in pods_on_node {
                    // Ignore pods whose assignment names a different node; a
                    // stale informer list must not corrupt this pool.
                    if pod_annotation(pod, ASSIGNED_NODE_ANNOTATION)
                        .is_some_and(|assigned| assigned != name)
                    {
                        continue;
                    }
                    pool.add_resource(pod);
                }
                debug!(node = name, devices = pool.device_count(), "device pool rebuilt");
                self.pools.insert(name.to_string(), pool);
            }
            None => {
                if self.pools.remove(name).is_some() {
                    info!(node = name, "device pool discarded");
                }
            }
        }
    }

    /// Forget a node entirely, e.g. on node deletion.
    pub fn remove_node(&self, name: &str) {
        self.pools.remove(name);
    }

    pub fn has_pool(&self, name: &str) -> bool {
        self.pools.contains_key(name)
    }

    /// Run `f` against the node's pool snapshot, if one exists.
    pub fn with_pool<R>(&self, name: &str, f: impl FnOnce(&DevicePool) -> R) -> Option<R> {
        self.pools.get(name).map(|pool| f(pool.value()))
    }

    /// Run `f` with mutable access to the node's pool, if one exists.
    pub fn with_pool_mut<R>(&self, name: &str, f: impl FnOnce(&mut DevicePool) -> R) -> Option<R> {
        self.pools.get_mut(name).map(|mut pool| f(pool.value_mut()))
    }
}
