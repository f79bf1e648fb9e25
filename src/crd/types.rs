//! Enum and reference types shared by the CRDs.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle state of an instance.
///
/// Provisioning moves `Pending -> Bootstrapping -> Running`. `InPlaceUpgrading`
/// is only entered from `Running` and returns to it. `Cleaning -> Cleaned` can
/// start from any state once deletion is requested. Values written by a newer
/// or foreign controller deserialize as `Unknown`.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum InstanceState {
    Pending,
    Bootstrapping,
    Running,
    InPlaceUpgrading,
    Cleaning,
    Cleaned,
    #[serde(other)]
    Unknown,
}

impl InstanceState {
    /// Whether moving from `from` (None = never set) to `to` follows the
    /// transition graph. Staying in the same state is always allowed.
    pub fn can_transition(from: Option<Self>, to: Self) -> bool {
        if from == Some(to) {
            return true;
        }
        match (from, to) {
            (Some(Self::Cleaned), _) => false,
            (_, Self::Cleaning) => true,
            (Some(Self::Cleaning), Self::Cleaned) => true,
            (None, Self::Pending)
            | (Some(Self::Pending), Self::Bootstrapping)
            | (Some(Self::Bootstrapping), Self::Running)
            | (Some(Self::Running), Self::InPlaceUpgrading)
            | (Some(Self::InPlaceUpgrading), Self::Running) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Bootstrapping => write!(f, "Bootstrapping"),
            Self::Running => write!(f, "Running"),
            Self::InPlaceUpgrading => write!(f, "InPlaceUpgrading"),
            Self::Cleaning => write!(f, "Cleaning"),
            Self::Cleaned => write!(f, "Cleaned"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Reference to a Node in the workload cluster.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// Subset of the node's system info reported back on the instance.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    #[serde(default)]
    pub kubelet_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_runtime_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
}
