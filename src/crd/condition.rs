//! Status conditions shared by all custom resources.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Tri-state condition value.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// How serious a `False` condition is.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionSeverity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for ConditionSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "Error"),
            Self::Warning => write!(f, "Warning"),
            Self::Info => write!(f, "Info"),
        }
    }
}

/// A typed, timestamped status entry.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub r#type: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<ConditionSeverity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_time: DateTime<Utc>,
}

/// Condition types.
pub mod types {
    pub const READY: &str = "Ready";

    pub const INSTANCE_BOOTSTRAPPED: &str = "InstanceBootstrapped";
    pub const INSTANCE_REPOSITORY_READY: &str = "InstanceRepositoryReady";
    pub const INSTANCE_BINARIES_READY: &str = "InstanceBinariesReady";
    pub const INSTANCE_CRI_READY: &str = "InstanceCRIReady";
    pub const INSTANCE_PROVISIONED: &str = "InstanceProvisioned";
    pub const INSTANCE_DELETING_BOOTSTRAPPED: &str = "InstanceDeletingBootstrapped";

    pub const NODE_HEALTHY: &str = "NodeHealthy";
    pub const DRAIN_SUCCEEDED: &str = "DrainSucceeded";
    pub const IN_PLACE_UPGRADED: &str = "InPlaceUpgraded";
    pub const IN_PLACE_UPGRADE_BINARIES_READY: &str = "InPlaceUpgradeBinariesReady";
    pub const ALL_INSTANCES_UPGRADE_COMPLETED: &str = "AllInstancesUpgradeCompleted";
    pub const INSTANCES_UPGRADE_ANNOTATED: &str = "InstancesUpgradeAnnotated";
}

/// Condition reasons.
pub mod reasons {
    pub const INIT_OS_FAILED: &str = "InitOSFailed";
    pub const REPOSITORY_FAILED: &str = "RepositoryFailed";
    pub const GET_BINARY_FAILED: &str = "GetBinaryFailed";
    pub const INSTALL_CRI_FAILED: &str = "InstallCRIFailed";
    pub const RUN_CLOUD_CONFIG_FAILED: &str = "RunCloudConfigFailed";
    pub const CLEAR_ENVIRONMENT_FAILED: &str = "ClearEnvironmentFailed";
    pub const CLEANING: &str = "Cleaning";

    pub const DRAINING: &str = "Draining";
    pub const DRAINING_FAILED: &str = "DrainingFailed";
    pub const IN_PLACE_UPGRADING: &str = "InPlaceUpgrading";

    pub const NODE_NOT_FOUND: &str = "NodeNotFound";
    pub const NODE_PROVISIONING: &str = "NodeProvisioning";
    pub const NODE_CONDITIONS_FAILED: &str = "NodeConditionsFailed";

    pub const WAITING_FOR_INSTANCES_UPGRADE: &str = "WaitingForInstancesUpgrade";
    pub const WAITING_FOR_CONTROL_PLANE: &str = "WaitingForControlPlane";
    pub const INVALID_CONFIGURATION: &str = "InvalidConfiguration";
    pub const UNKNOWN_STATE: &str = "UnknownState";
}
