//! `Instance` custom resource.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::condition::Condition;
use super::types::{InstanceState, NodeInfo, NodeRef};

/// `Instance` spec: one SSH-reachable machine.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "sko.io",
    version = "v1alpha1",
    kind = "Instance",
    namespaced,
    status = "InstanceStatus",
    printcolumn = r#"{"name":"ADDRESS","type":"string","jsonPath":".spec.address"}"#,
    printcolumn = r#"{"name":"STATE","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"NODE","type":"string","jsonPath":".status.nodeRef.name"}"#,
    printcolumn = r#"{"name":"KUBELET","type":"string","jsonPath":".status.nodeInfo.kubeletVersion"}"#,
    printcolumn = r#"{"name":"AGE","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    /// Hostname applied during bootstrap.
    pub name: String,
    pub address: String,
    pub internal_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub auth: InstanceAuth,
    #[serde(default = "default_arch")]
    pub arch: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

const fn default_port() -> u16 {
    22
}

fn default_user() -> String {
    "root".to_string()
}

fn default_arch() -> String {
    "amd64".to_string()
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceAuth {
    /// Secret holding `ssh-privatekey`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_secret: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    /// Unset until the first reconcile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<InstanceState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<NodeRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_info: Option<NodeInfo>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Terminal problem that stops the state machine until cleared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

impl Instance {
    pub fn state(&self) -> Option<InstanceState> {
        self.status.as_ref().and_then(|s| s.state)
    }

    pub fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map_or(&[], |s| s.conditions.as_slice())
    }

    /// Kubelet version last reported by the node, or "" when unknown.
    pub fn kubelet_version(&self) -> &str {
        self.status
            .as_ref()
            .and_then(|s| s.node_info.as_ref())
            .map_or("", |n| n.kubelet_version.as_str())
    }

    pub fn upgrade_target_version(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()?
            .get(super::UPGRADE_TARGET_VERSION_ANNOTATION)
            .map(String::as_str)
    }

    pub fn is_control_plane(&self) -> bool {
        self.metadata
            .labels
            .as_ref()
            .is_some_and(|l| l.contains_key(super::CONTROL_PLANE_LABEL))
    }

    pub fn cluster_name(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()?
            .get(super::CLUSTER_NAME_LABEL)
            .map(String::as_str)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Status, created on first use.
    pub fn status_mut(&mut self) -> &mut InstanceStatus {
        self.status.get_or_insert_with(InstanceStatus::default)
    }
}
