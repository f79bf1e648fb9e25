//! Custom resource definitions: `Cluster`, `Machine`, `Instance` and the
//! grouping objects that own machines.

pub mod cluster;
pub mod condition;
pub mod groups;
pub mod instance;
pub mod machine;
pub mod types;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

pub use cluster::{
    ApiEndpoint, AuthSpec, Cluster, ClusterSpec, ClusterStatus, ContainerManagerSpec, HostSpec,
    RepositorySpec,
};
pub use condition::{Condition, ConditionSeverity, ConditionStatus};
pub use groups::{
    ControlPlaneGroup, ControlPlaneGroupSpec, MachineDeployment, MachineDeploymentSpec,
    MachineSet, MachineSetSpec,
};
pub use instance::{Instance, InstanceAuth, InstanceSpec, InstanceStatus};
pub use machine::{Bootstrap, Machine, MachineSpec, MachineStatus};
pub use types::{InstanceState, NodeInfo, NodeRef};

/// Label carrying the owning cluster name on machines, instances and groups.
pub const CLUSTER_NAME_LABEL: &str = "sko.io/cluster-name";

/// Label marking control plane machines and instances.
pub const CONTROL_PLANE_LABEL: &str = "sko.io/control-plane";

/// Annotation whose presence starts an in-place upgrade to the given version.
pub const UPGRADE_TARGET_VERSION_ANNOTATION: &str = "sko.io/upgrade-target-version";

/// Machine annotation that disables cordon and drain.
pub const EXCLUDE_NODE_DRAINING_ANNOTATION: &str = "sko.io/exclude-node-draining";

/// Finalizer held by instances until remote cleanup succeeds.
pub const INSTANCE_FINALIZER: &str = "instance.sko.io";

/// Role names used in the cluster host inventory.
pub const ROLE_CONTROL_PLANE: &str = "control-plane";
pub const ROLE_WORKER: &str = "worker";

/// All CRDs served by the operator, in install order.
pub fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![
        Cluster::crd(),
        ControlPlaneGroup::crd(),
        MachineDeployment::crd(),
        MachineSet::crd(),
        Machine::crd(),
        Instance::crd(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_crds_group_and_names() {
        let crds = all_crds();
        assert_eq!(crds.len(), 6);
        for crd in &crds {
            assert_eq!(crd.spec.group, "sko.io");
            assert_eq!(crd.spec.scope, "Namespaced");
        }
        let kinds: Vec<&str> = crds.iter().map(|c| c.spec.names.kind.as_str()).collect();
        assert!(kinds.contains(&"Instance"));
        assert!(kinds.contains(&"Cluster"));
    }
}
