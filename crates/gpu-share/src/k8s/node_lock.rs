//! Distributed per-node allocation lock, kept as a timestamp annotation on
//! the node object.
//!
//! Acquire reads the node, refuses while a non-expired stamp is present, and
//! claims the lock by writing its own stamp; release deletes the key. The
//! expiry lets a new scheduler instance take over a lock left behind by a
//! crashed holder. The read-then-claim pair is not atomic, which matches the
//! source-of-truth semantics of annotations: the allocate path re-decides
//! under the lock, so a lost race costs a retry, not correctness.

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use error_stack::Report;
use error_stack::ResultExt;
use tracing::warn;

use crate::error::DeviceError;
use crate::k8s::annotations::NODE_LOCK_ANNOTATION;
use crate::k8s::patcher::AnnotationChanges;
use crate::k8s::patcher::AnnotationPatcher;
use crate::k8s::types::KubernetesError;

/// Try to take the allocation lock for `node`.
///
/// # Errors
///
/// - [`DeviceError::LockUnavailable`] when another holder's stamp is still
///   live, or when the node cannot be read or patched
pub async fn lock_node<P: AnnotationPatcher + ?Sized>(
    patcher: &P,
    node: &str,
    expiry: Duration,
) -> Result<(), Report<DeviceError>> {
    let annotations = patcher
        .node_annotations(node)
        .await
        .change_context(DeviceError::LockUnavailable {
            node: node.to_string(),
            message: "failed to read lock state".to_string(),
        })?;

    if let Some(stamp) = annotations.get(NODE_LOCK_ANNOTATION) {
        let held_since = DateTime::parse_from_rfc3339(stamp)
            .map(|ts| ts.with_timezone(&Utc))
            .ok();
        match held_since {
            Some(since) if Utc::now() < since + expiry => {
                return Err(Report::new(DeviceError::LockUnavailable {
                    node: node.to_string(),
                    message: format!("locked since {stamp}"),
                }));
            }
            _ => warn!(node, stamp, "taking over expired or garbled node lock"),
        }
    }

    let mut changes = AnnotationChanges::new();
    changes.insert(
        NODE_LOCK_ANNOTATION.to_string(),
        Some(Utc::now().to_rfc3339()),
    );
    patcher
        .patch_node_annotations(node, changes)
        .await
        .change_context(DeviceError::LockUnavailable {
            node: node.to_string(),
            message: "failed to claim lock".to_string(),
        })
}

/// Release the allocation lock for `node` by deleting its stamp.
pub async fn unlock_node<P: AnnotationPatcher + ?Sized>(
    patcher: &P,
    node: &str,
) -> Result<(), Report<KubernetesError>> {
    let mut changes = AnnotationChanges::new();
    changes.insert(NODE_LOCK_ANNOTATION.to_string(), None);
    patcher.patch_node_annotations(node, changes).await
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::pool::PodKey;

    #[derive(Default)]
    struct FakeNodeStore {
        annotations: Mutex<BTreeMap<String, String>>,
    }

    #[async_trait]
    impl AnnotationPatcher for FakeNodeStore {
        async fn patch_pod_annotations(
            &self,
            _pod: &PodKey,
            _changes: AnnotationChanges,
        ) -> Result<(), Report<KubernetesError>> {
            unreachable!("node lock never patches pods")
        }

        async fn patch_node_annotations(
            &self,
            _node: &str,
            changes: AnnotationChanges,
        ) -> Result<(), Report<KubernetesError>> {
            let mut annotations = self.annotations.lock().unwrap();
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
            Ok(self.annotations.lock().unwrap().clone())
        }
    }

    #[tokio::test]
    async fn acquires_free_lock_and_releases() {
        let store = FakeNodeStore::default();
        lock_node(&store, "node-a", Duration::seconds(300)).await.unwrap();
        assert!(store
            .annotations
            .lock()
            .unwrap()
            .contains_key(NODE_LOCK_ANNOTATION));

        unlock_node(&store, "node-a").await.unwrap();
        assert!(!store
            .annotations
            .lock()
            .unwrap()
            .contains_key(NODE_LOCK_ANNOTATION));
    }

    #[tokio::test]
    async fn refuses_live_lock() {
        let store = FakeNodeStore::default();
        lock_node(&store, "node-a", Duration::seconds(300)).await.unwrap();

        let err = lock_node(&store, "node-a", Duration::seconds(300))
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            DeviceError::LockUnavailable { .. }
        ));
    }

    #[tokio::test]
    async fn takes_over_expired_lock() {
        let store = FakeNodeStore::default();
        store.annotations.lock().unwrap().insert(
            NODE_LOCK_ANNOTATION.to_string(),
            "2020-01-01T00:00:00+00:00".to_string(),
        );
        lock_node(&store, "node-a", Duration::seconds(300)).await.unwrap();
    }

    #[tokio::test]
    async fn takes_over_garbled_lock() {
        let store = FakeNodeStore::default();
        store
            .annotations
            .lock()
            .unwrap()
            .insert(NODE_LOCK_ANNOTATION.to_string(), "not-a-time".to_string());
        lock_node(&store, "node-a", Duration::seconds(300)).await.unwrap();
    }
}
