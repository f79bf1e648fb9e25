//! Node reference, node info and `NodeHealthy` from the workload cluster.

use k8s_openapi::api::core::v1::Node;
use kube::runtime::controller::Action;
use tracing::{info, warn};

use super::Scope;
use crate::controller::REQUEUE_WAIT;
use crate::crd::condition::{reasons, types};
use crate::crd::{ConditionSeverity, ConditionStatus, Machine, NodeInfo, NodeRef};
use crate::error::{NodeError, SkoError};
use crate::node_health;
use crate::status;
use crate::store::ObjectStore;

/// Refresh the instance's view of its node. Returns an action when the
/// rest of the reconcile has to wait for the node.
pub(super) async fn reconcile<S: ObjectStore>(
    scope: &mut Scope<'_, S>,
    machine: &Machine,
) -> Result<Option<Action>, SkoError> {
    let Some(provider_id) = machine.spec.provider_id.as_deref() else {
        info!("Waiting for the provider ID of machine {:?}", machine.metadata.name);
        return Ok(Some(Action::requeue(REQUEUE_WAIT)));
    };

    let ctx = scope.ctx;
    let lookup = ctx
        .nodes
        .node_by_provider_id(scope.namespace(), &machine.spec.cluster_name, provider_id)
        .await;
    let before = scope.instance.status.clone();

    let node = match lookup {
        Ok(Some(node)) => node,
        Ok(None) => return node_missing(scope, provider_id).await,
        Err(e) => {
            warn!("Failed to look up node of {}: {}", scope.name(), e);
            scope
                .warning(
                    "FailedGetNode",
                    &format!("Failed to look up node {provider_id}: {e}"),
                )
                .await;
            return Ok(Some(Action::requeue(REQUEUE_WAIT)));
        }
    };

    let node_ref = NodeRef {
        name: node.metadata.name.clone().unwrap_or_default(),
        uid: node.metadata.uid.clone(),
    };
    let node_ref_changed = scope
        .instance
        .status
        .as_ref()
        .and_then(|s| s.node_ref.as_ref())
        != Some(&node_ref);
    let node_name = node_ref.name.clone();

    let status = scope.instance.status_mut();
    status.node_ref = Some(node_ref);
    if let Some(info) = node_info(&node) {
        status.node_info = Some(info);
    }

    let conditions = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.clone())
        .unwrap_or_default();
    match node_health::summarize(&conditions) {
        (ConditionStatus::True, _) => {
            status::mark_true(scope.conditions_mut(), types::NODE_HEALTHY);
        }
        (ConditionStatus::False, message) => status::mark_false(
            scope.conditions_mut(),
            types::NODE_HEALTHY,
            reasons::NODE_CONDITIONS_FAILED,
            ConditionSeverity::Warning,
            message.trim_end(),
        ),
        (ConditionStatus::Unknown, message) => status::mark_unknown(
            scope.conditions_mut(),
            types::NODE_HEALTHY,
            reasons::NODE_CONDITIONS_FAILED,
            message.trim_end(),
        ),
    }

    if scope.instance.status != before {
        scope.persist().await?;
    }
    if node_ref_changed {
        info!("Set node ref {} on instance {}", node_name, scope.name());
        scope
            .event(
                "SuccessfulSetNodeRef",
                &format!("Set node ref to node {node_name}"),
            )
            .await;
    }
    Ok(None)
}

async fn node_missing<S: ObjectStore>(
    scope: &mut Scope<'_, S>,
    provider_id: &str,
) -> Result<Option<Action>, SkoError> {
    let known = scope
        .instance
        .status
        .as_ref()
        .and_then(|s| s.node_ref.as_ref())
        .map(|r| r.name.clone());

    match known {
        Some(name) => {
            status::mark_false(
                scope.conditions_mut(),
                types::NODE_HEALTHY,
                reasons::NODE_NOT_FOUND,
                ConditionSeverity::Error,
                format!("Node {name} was removed from the workload cluster"),
            );
            scope.persist().await?;
            Err(NodeError::NotFound(name).into())
        }
        None => {
            info!("Waiting for node {} to register", provider_id);
            status::mark_false(
                scope.conditions_mut(),
                types::NODE_HEALTHY,
                reasons::NODE_PROVISIONING,
                ConditionSeverity::Warning,
                "Waiting for the node to register",
            );
            scope.persist().await?;
            Ok(Some(Action::requeue(REQUEUE_WAIT)))
        }
    }
}

fn node_info(node: &Node) -> Option<NodeInfo> {
    let info = node.status.as_ref()?.node_info.as_ref()?;
    Some(NodeInfo {
        kubelet_version: info.kubelet_version.clone(),
        kernel_version: Some(info.kernel_version.clone()),
        os_image: Some(info.os_image.clone()),
        container_runtime_version: Some(info.container_runtime_version.clone()),
        architecture: Some(info.architecture.clone()),
    })
}
