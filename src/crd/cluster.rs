//! `Cluster` custom resource.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::condition::Condition;

/// `Cluster` spec: the SSH inventory and the shared settings used to
/// provision its machines.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "sko.io",
    version = "v1alpha1",
    kind = "Cluster",
    namespaced,
    status = "ClusterStatus",
    printcolumn = r#"{"name":"ENDPOINT","type":"string","jsonPath":".spec.controlPlaneEndpoint.host"}"#,
    printcolumn = r#"{"name":"READY","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"PAUSED","type":"boolean","jsonPath":".spec.paused"}"#,
    printcolumn = r#"{"name":"UPGRADE","type":"string","jsonPath":".metadata.annotations.sko\\.io/upgrade-target-version"}"#,
    printcolumn = r#"{"name":"AGE","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Kubernetes distribution installed on the hosts.
    #[serde(default = "default_distribution")]
    pub distribution: String,

    /// Endpoint of the workload cluster API server.
    pub control_plane_endpoint: ApiEndpoint,

    /// Optional load balancer in front of the control plane.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_load_balancer: Option<LoadBalancerSpec>,

    /// Stops machine reconciliation. Set by the operator while an in-place
    /// upgrade is rolling out.
    #[serde(default)]
    pub paused: bool,

    /// Name of the `ControlPlaneGroup` owning the control plane machines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_ref: Option<String>,

    /// SSH-reachable hosts available to this cluster.
    #[serde(default)]
    pub hosts: Vec<HostSpec>,

    /// Default SSH settings for all hosts.
    #[serde(default)]
    pub auth: AuthSpec,

    #[serde(default)]
    pub container_manager: ContainerManagerSpec,

    /// Package repository settings. No packages are installed when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<RepositorySpec>,

    /// Base URL for kubeadm, kubelet and kubectl downloads.
    #[serde(default = "default_binary_base_url")]
    pub binary_base_url: String,
}

fn default_distribution() -> String {
    "kubernetes".to_string()
}

fn default_binary_base_url() -> String {
    "https://dl.k8s.io/release".to_string()
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiEndpoint {
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

const fn default_api_port() -> u16 {
    6443
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerSpec {
    pub host: String,
}

/// SSH connection settings. Host-level values override cluster-level ones.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Secret holding the `ssh-privatekey` used to log in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_secret: Option<String>,
}

/// One machine in the SSH inventory.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HostSpec {
    pub name: String,
    pub address: String,
    pub internal_address: String,
    /// `control-plane` and/or `worker`.
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default = "default_arch")]
    pub arch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthSpec>,
}

fn default_arch() -> String {
    "amd64".to_string()
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerManagerSpec {
    #[serde(default = "default_container_manager", rename = "type")]
    pub kind: String,
    #[serde(default = "default_containerd_version")]
    pub version: String,
}

impl Default for ContainerManagerSpec {
    fn default() -> Self {
        Self {
            kind: default_container_manager(),
            version: default_containerd_version(),
        }
    }
}

fn default_container_manager() -> String {
    "containerd".to_string()
}

fn default_containerd_version() -> String {
    "1.7.13".to_string()
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepositorySpec {
    /// Refresh the package index before installing.
    #[serde(default)]
    pub update: bool,
    /// Extra packages on top of the ones kubeadm needs.
    #[serde(default)]
    pub packages: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default)]
    pub ready: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

impl HostSpec {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

impl Cluster {
    /// Target version of a pending in-place upgrade, if any.
    pub fn upgrade_target_version(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()?
            .get(super::UPGRADE_TARGET_VERSION_ANNOTATION)
            .map(String::as_str)
    }
}
