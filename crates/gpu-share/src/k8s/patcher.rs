//! The annotation persistence seam.
//!
//! Everything this subsystem writes durably goes through
//! [`AnnotationPatcher`] as a single merge patch per decision, so the
//! scheduling logic stays testable without an apiserver and every network
//! call carries a bounded timeout.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Api;
use kube::Client;
use kube::Config;
use serde_json::json;

use crate::k8s::types::KubernetesError;
use crate::pool::PodKey;

/// Annotation changes applied as one merge patch; `None` deletes the key.
pub type AnnotationChanges = BTreeMap<String, Option<String>>;

#[async_trait]
pub trait AnnotationPatcher: Send + Sync {
    async fn patch_pod_annotations(
        &self,
        pod: &PodKey,
        changes: AnnotationChanges,
    ) -> Result<(), Report<KubernetesError>>;

    async fn patch_node_annotations(
        &self,
        node: &str,
        changes: AnnotationChanges,
    ) -> Result<(), Report<KubernetesError>>;

    /// Current annotations of a node, for the distributed lock's
    /// read-then-claim sequence.
    async fn node_annotations(
        &self,
        node: &str,
    ) -> Result<BTreeMap<String, String>, Report<KubernetesError>>;
}

/// [`AnnotationPatcher`] backed by the cluster apiserver.
pub struct KubePatcher {
    client: Client,
    timeout: Duration,
}

impl KubePatcher {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, Report<KubernetesError>>
    where
        F: std::future::Future<Output = Result<T, kube::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.change_context(KubernetesError::PatchFailed {
                message: "apiserver rejected the call".to_string(),
            }),
            Err(_) => Err(Report::new(KubernetesError::Timeout {
                timeout_secs: self.timeout.as_secs(),
            })),
        }
    }
}

fn annotation_patch(changes: &AnnotationChanges) -> serde_json::Value {
    json!({ "metadata": { "annotations": changes } })
}

#[async_trait]
impl AnnotationPatcher for KubePatcher {
    async fn patch_pod_annotations(
        &self,
        pod: &PodKey,
        changes: AnnotationChanges,
    ) -> Result<(), Report<KubernetesError>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        self.bounded(api.patch(
            &pod.name,
            &PatchParams::default(),
            &Patch::Merge(annotation_patch(&changes)),
        ))
        .await
        .attach_printable_lazy(|| format!("patching pod {pod}"))?;
        Ok(())
    }

    async fn patch_node_annotations(
        &self,
        node: &str,
        changes: AnnotationChanges,
    ) -> Result<(), Report<KubernetesError>> {
        let api: Api<Node> = Api::all(self.client.clone());
        self.bounded(api.patch(
            node,
            &PatchParams::default(),
            &Patch::Merge(annotation_patch(&changes)),
        ))
        .await
        .attach_printable_lazy(|| format!("patching node {node}"))?;
        Ok(())
    }

    async fn node_annotations(
        &self,
        node: &str,
    ) -> Result<BTreeMap<String, String>, Report<KubernetesError>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let node_obj = match tokio::time::timeout(self.timeout, api.get(node)).await {
            Ok(result) => result.change_context(KubernetesError::ReadFailed {
                message: format!("fetching node {node}"),
            })?,
            Err(_) => {
                return Err(Report::new(KubernetesError::Timeout {
                    timeout_secs: self.timeout.as_secs(),
                }))
            }
        };
        Ok(node_obj.metadata.annotations.unwrap_or_default())
    }
}

/// Build a kube client from an explicit kubeconfig path, or the default
/// in-cluster / `~/.kube/config` resolution when none is given.
pub async fn init_kube_client(
    kubeconfig: Option<PathBuf>,
) -> Result<Client, Report<KubernetesError>> {
    let client = match kubeconfig {
        Some(kubeconfig_path) => {
            let kubeconfig = Kubeconfig::read_from(&kubeconfig_path).change_context(
                KubernetesError::ConnectionFailed {
                    message: format!(
                        "Failed to read kubeconfig file: {}",
                        kubeconfig_path.display()
                    ),
                },
            )?;

            let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .change_context(KubernetesError::ConnectionFailed {
                    message: format!(
                        "Failed to create config from kubeconfig: {}",
                        kubeconfig_path.display()
                    ),
                })?;

            Client::try_from(config).change_context(KubernetesError::ConnectionFailed {
                message: "Failed to create Kubernetes client from custom kubeconfig".to_string(),
            })?
        }
        None => Client::try_default()
            .await
            .change_context(KubernetesError::ConnectionFailed {
                message: "Failed to create Kubernetes client".to_string(),
            })?,
    };
    Ok(client)
}
