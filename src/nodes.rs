//! Workload cluster node access: lookup, cordon and drain.
//!
//! The workload cluster API is reached with the kubeconfig stored in the
//! `<cluster>-kubeconfig` Secret next to the `Cluster`.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod, Secret};
use kube::Api;
use kube::api::{EvictParams, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::error::NodeError;

/// Secret key holding the workload kubeconfig.
pub const KUBECONFIG_SECRET_KEY: &str = "value";

/// Annotation set by the kubelet on static pod mirrors.
const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

pub fn kubeconfig_secret_name(cluster: &str) -> String {
    format!("{cluster}-kubeconfig")
}

/// Result of one drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// No evictable pods are left on the node.
    Done,
    /// Evictions were requested or refused; this many pods remain.
    Pending(usize),
}

/// Node operations against a cluster's workload API server.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeAccess: Send + Sync {
    /// Find the node whose `spec.providerID` equals `provider_id`.
    async fn node_by_provider_id(
        &self,
        namespace: &str,
        cluster: &str,
        provider_id: &str,
    ) -> Result<Option<Node>, NodeError>;

    /// Set `spec.unschedulable` on the node.
    async fn cordon(
        &self,
        namespace: &str,
        cluster: &str,
        node: &str,
        unschedulable: bool,
    ) -> Result<(), NodeError>;

    /// Request eviction of every evictable pod on the node.
    async fn drain(
        &self,
        namespace: &str,
        cluster: &str,
        node: &str,
    ) -> Result<DrainOutcome, NodeError>;
}

/// `NodeAccess` that builds a client from the workload kubeconfig secret.
pub struct KubeNodeAccess {
    client: kube::Client,
}

impl KubeNodeAccess {
    pub const fn new(client: kube::Client) -> Self {
        Self { client }
    }

    async fn workload_client(
        &self,
        namespace: &str,
        cluster: &str,
    ) -> Result<kube::Client, NodeError> {
        let secret_name = kubeconfig_secret_name(cluster);
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = secrets.get(&secret_name).await.map_err(|e| {
            NodeError::Kubeconfig(format!("reading {namespace}/{secret_name}: {e}"))
        })?;
        let raw = secret
            .data
            .and_then(|mut d| d.remove(KUBECONFIG_SECRET_KEY))
            .ok_or_else(|| {
                NodeError::Kubeconfig(format!(
                    "{namespace}/{secret_name} has no {KUBECONFIG_SECRET_KEY} key"
                ))
            })?;
        let yaml = String::from_utf8(raw.0)
            .map_err(|_| NodeError::Kubeconfig(format!("{namespace}/{secret_name} is not UTF-8")))?;

        let kubeconfig = Kubeconfig::from_yaml(&yaml)
            .map_err(|e| NodeError::Kubeconfig(format!("cluster '{cluster}': {e}")))?;
        let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| NodeError::Kubeconfig(format!("cluster '{cluster}': {e}")))?;
        kube::Client::try_from(config)
            .map_err(|e| NodeError::Kubeconfig(format!("cluster '{cluster}': {e}")))
    }
}

#[async_trait]
impl NodeAccess for KubeNodeAccess {
    async fn node_by_provider_id(
        &self,
        namespace: &str,
        cluster: &str,
        provider_id: &str,
    ) -> Result<Option<Node>, NodeError> {
        let client = self.workload_client(namespace, cluster).await?;
        let nodes: Api<Node> = Api::all(client);
        let list = nodes
            .list(&ListParams::default())
            .await
            .map_err(|e| NodeError::Client(format!("Failed to list nodes: {e}")))?;
        Ok(list
            .items
            .into_iter()
            .find(|n| n.spec.as_ref().and_then(|s| s.provider_id.as_deref()) == Some(provider_id)))
    }

    async fn cordon(
        &self,
        namespace: &str,
        cluster: &str,
        node: &str,
        unschedulable: bool,
    ) -> Result<(), NodeError> {
        let client = self.workload_client(namespace, cluster).await?;
        let nodes: Api<Node> = Api::all(client);
        let patch = serde_json::json!({ "spec": { "unschedulable": unschedulable } });
        nodes
            .patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| NodeError::Client(format!("Failed to patch node {node}: {e}")))?;
        debug!("Set unschedulable={} on node {}", unschedulable, node);
        Ok(())
    }

    async fn drain(
        &self,
        namespace: &str,
        cluster: &str,
        node: &str,
    ) -> Result<DrainOutcome, NodeError> {
        let client = self.workload_client(namespace, cluster).await?;
        let pods: Api<Pod> = Api::all(client.clone());
        let list = pods
            .list(&ListParams::default().fields(&format!("spec.nodeName={node}")))
            .await
            .map_err(|e| NodeError::Client(format!("Failed to list pods on {node}: {e}")))?;

        let evictable: Vec<&Pod> = list.items.iter().filter(|p| is_evictable(p)).collect();
        if evictable.is_empty() {
            return Ok(DrainOutcome::Done);
        }

        info!("Evicting {} pods from node {}", evictable.len(), node);
        for pod in &evictable {
            let pod_ns = pod.metadata.namespace.as_deref().unwrap_or("default");
            let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
            let api: Api<Pod> = Api::namespaced(client.clone(), pod_ns);
            match api.evict(pod_name, &EvictParams::default()).await {
                Ok(_) => debug!("Evicted {}/{}", pod_ns, pod_name),
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(kube::Error::Api(ae)) if ae.code == 429 => {
                    warn!(
                        "Eviction of {}/{} blocked by a disruption budget",
                        pod_ns, pod_name
                    );
                }
                Err(e) => {
                    return Err(NodeError::Client(format!(
                        "Failed to evict {pod_ns}/{pod_name}: {e}"
                    )));
                }
            }
        }
        Ok(DrainOutcome::Pending(evictable.len()))
    }
}

/// Pods that drain must evict: not DaemonSet-managed, not static mirrors and
/// not already finished.
fn is_evictable(pod: &Pod) -> bool {
    let daemonset = pod
        .metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|o| o.kind == "DaemonSet"));
    let mirror = pod
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(MIRROR_POD_ANNOTATION));
    let finished = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|p| p == "Succeeded" || p == "Failed");
    !(daemonset || mirror || finished)
}
