//! In-place upgrade of one instance.
//!
//! Binaries are staged first so a failed download leaves the node running
//! the old version. The first control plane runs `kubeadm upgrade apply`
//! under the cluster lock; every other member runs `kubeadm upgrade node`.
//! Workers wait until the whole control plane is at the target version.

use chrono::Utc;
use kube::runtime::controller::Action;
use tracing::{info, warn};

use super::Scope;
use crate::controller::{REQUEUE_DRAIN, REQUEUE_SHORT, REQUEUE_WAIT};
use crate::crd::condition::{reasons, types};
use crate::crd::{
    Cluster, ConditionSeverity, ControlPlaneGroup, EXCLUDE_NODE_DRAINING_ANNOTATION,
    InstanceState, Machine,
};
use crate::error::SkoError;
use crate::lock::ClusterLock;
use crate::nodes::DrainOutcome;
use crate::phases::binaries::{install_staged_command, stage_commands};
use crate::phases::run_all;
use crate::status;
use crate::store::{ObjectStore, cluster_labels};

const RESTART_KUBELET_COMMAND: &str = "systemctl daemon-reload && systemctl restart kubelet";
const UPGRADE_NODE_COMMAND: &str = "kubeadm upgrade node";

/// Role of the instance in the rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpgradeRole {
    FirstControlPlane,
    JoiningControlPlane,
    Worker,
}

impl UpgradeRole {
    fn command(self, version: &str) -> String {
        match self {
            Self::FirstControlPlane => format!(
                "kubeadm upgrade apply {version} -y --ignore-preflight-errors=all \
                 --allow-experimental-upgrades --allow-release-candidate-upgrades \
                 --etcd-upgrade=false --certificate-renewal=true"
            ),
            Self::JoiningControlPlane | Self::Worker => UPGRADE_NODE_COMMAND.to_string(),
        }
    }

    const fn failure_event(self) -> &'static str {
        match self {
            Self::FirstControlPlane | Self::JoiningControlPlane => {
                "FailedInPlaceUpgradeControlPlane"
            }
            Self::Worker => "FailedInPlaceUpgradeWorker",
        }
    }
}

pub(super) async fn reconcile<S: ObjectStore>(
    scope: &mut Scope<'_, S>,
    machine: &mut Machine,
    cluster: &Cluster,
    target: &str,
) -> Result<Action, SkoError> {
    let Some(node_name) = scope
        .instance
        .status
        .as_ref()
        .and_then(|s| s.node_ref.as_ref())
        .map(|r| r.name.clone())
    else {
        info!("Instance {} has no node yet, delaying upgrade", scope.name());
        return Ok(Action::requeue(REQUEUE_WAIT));
    };

    if scope.instance.kubelet_version() == target {
        // The kubelet can pick up the new version before the machine is
        // patched, e.g. after a failed write or an outside restart.
        if !machine.has_version(target) {
            machine.spec.version = Some(target.to_string());
            *machine = scope.ctx.store.replace(&*machine).await?;
        }
        let before = scope.instance.status.clone();
        status::mark_true(scope.conditions_mut(), types::IN_PLACE_UPGRADED);
        scope.set_state(InstanceState::Running);
        if scope.instance.status != before {
            info!(instance = scope.name(), version = target, "In-place upgrade done");
            scope.persist().await?;
        }
        return Ok(Action::await_change());
    }

    scope.set_state(InstanceState::InPlaceUpgrading);
    let ctx = scope.ctx;
    let runner = ctx.connector.connect(&scope.instance).await?;

    if !status::is_true(scope.instance.conditions(), types::IN_PLACE_UPGRADE_BINARIES_READY) {
        let commands = stage_commands(
            &cluster.spec.binary_base_url,
            target,
            &scope.instance.spec.arch,
        );
        if let Err(e) = run_all(runner.as_ref(), &commands).await {
            warn!("Failed to stage {} binaries on {}: {}", target, scope.name(), e);
            status::mark_false(
                scope.conditions_mut(),
                types::IN_PLACE_UPGRADE_BINARIES_READY,
                reasons::GET_BINARY_FAILED,
                ConditionSeverity::Error,
                e.to_string(),
            );
            scope.persist().await?;
            return Ok(Action::requeue(REQUEUE_WAIT));
        }
        status::mark_true(scope.conditions_mut(), types::IN_PLACE_UPGRADE_BINARIES_READY);
        scope
            .event(
                "InPlaceUpgradeDownloadBinaries",
                &format!("Downloaded {target} binaries"),
            )
            .await;
    }
    if !status::has(scope.instance.conditions(), types::IN_PLACE_UPGRADED) {
        status::mark_false(
            scope.conditions_mut(),
            types::IN_PLACE_UPGRADED,
            reasons::IN_PLACE_UPGRADING,
            ConditionSeverity::Info,
            format!("Upgrading to {target}"),
        );
    }
    scope.persist().await?;

    let cluster_name = machine.spec.cluster_name.clone();
    let namespace = scope.namespace().to_string();
    let excluded = drain_excluded(machine);
    let drain = !excluded && !drain_timed_out(scope, machine);
    let lock = ClusterLock::new(&ctx.store).with_metrics(&ctx.metrics);
    let mut patched = Ok(());

    if !machine.has_version(target) {
        let role = classify(scope, machine, cluster, target).await?;
        match role {
            UpgradeRole::FirstControlPlane => {
                if !lock.lock(cluster, scope.name()).await {
                    info!("Cluster lock is held, {} waits its turn", scope.name());
                    return Ok(Action::requeue(REQUEUE_WAIT));
                }
            }
            UpgradeRole::JoiningControlPlane => {
                lock.unlock(cluster).await;
            }
            UpgradeRole::Worker => {
                if !control_plane_upgraded(scope, cluster, target).await? {
                    info!("Worker {} waits for the control plane", scope.name());
                    return Ok(Action::requeue(REQUEUE_SHORT));
                }
            }
        }

        if drain && !status::is_true(scope.instance.conditions(), types::DRAIN_SUCCEEDED) {
            if !status::has(scope.instance.conditions(), types::DRAIN_SUCCEEDED) {
                status::mark_false(
                    scope.conditions_mut(),
                    types::DRAIN_SUCCEEDED,
                    reasons::DRAINING,
                    ConditionSeverity::Info,
                    "Draining the node before upgrade",
                );
                scope.persist().await?;
            }
            let drained = match ctx
                .nodes
                .cordon(&namespace, &cluster_name, &node_name, true)
                .await
            {
                Ok(()) => ctx.nodes.drain(&namespace, &cluster_name, &node_name).await,
                Err(e) => Err(e),
            };
            match drained {
                Ok(DrainOutcome::Done) => {
                    status::mark_true(scope.conditions_mut(), types::DRAIN_SUCCEEDED);
                    scope.persist().await?;
                    scope
                        .event("SuccessfulDrainNode", &format!("Drained node {node_name}"))
                        .await;
                }
                Ok(DrainOutcome::Pending(remaining)) => {
                    info!("Node {} still has {} pods to evict", node_name, remaining);
                    return Ok(Action::requeue(REQUEUE_DRAIN));
                }
                Err(e) => {
                    status::mark_false(
                        scope.conditions_mut(),
                        types::DRAIN_SUCCEEDED,
                        reasons::DRAINING_FAILED,
                        ConditionSeverity::Warning,
                        e.to_string(),
                    );
                    scope.persist().await?;
                    scope
                        .warning(
                            "FailedDrainNode",
                            &format!("Failed to drain node {node_name}: {e}"),
                        )
                        .await;
                    if role == UpgradeRole::FirstControlPlane {
                        lock.unlock(cluster).await;
                    }
                    return Ok(Action::requeue(REQUEUE_WAIT));
                }
            }
        }

        let command = format!(
            "{} && {}",
            install_staged_command(target),
            role.command(target)
        );
        info!(instance = scope.name(), ?role, version = target, "Running upgrade");
        match runner.run_privileged(&command).await {
            Ok(_) => {
                machine.spec.version = Some(target.to_string());
                match ctx.store.replace(&*machine).await {
                    Ok(updated) => *machine = updated,
                    Err(e) => {
                        warn!("Failed to record {} on machine of {}: {}", target, scope.name(), e);
                        patched = Err(e);
                    }
                }
            }
            Err(e) => {
                scope
                    .warning(
                        role.failure_event(),
                        &format!("Failed to upgrade {} to {target}: {e}", runner.host()),
                    )
                    .await;
                if role == UpgradeRole::FirstControlPlane {
                    lock.unlock(cluster).await;
                }
            }
        }
    }

    if let Err(e) = runner.run_privileged(RESTART_KUBELET_COMMAND).await {
        scope
            .warning(
                "FailedInPlaceRestartingKubelet",
                &format!("Failed to restart kubelet: {e}"),
            )
            .await;
    }
    if !excluded
        && let Err(e) = ctx
            .nodes
            .cordon(&namespace, &cluster_name, &node_name, false)
            .await
    {
        scope
            .warning(
                "FailedUncordonNode",
                &format!("Failed to uncordon node {node_name}: {e}"),
            )
            .await;
    }

    patched?;
    Ok(Action::requeue(REQUEUE_WAIT))
}

fn drain_excluded(machine: &Machine) -> bool {
    machine
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(EXCLUDE_NODE_DRAINING_ANNOTATION))
}

/// Whether draining has been attempted for longer than the machine allows.
fn drain_timed_out<S: ObjectStore>(scope: &Scope<'_, S>, machine: &Machine) -> bool {
    let Some(timeout) = machine.spec.node_drain_timeout_seconds.filter(|t| *t > 0) else {
        return false;
    };
    let Some(drain) = status::get(scope.instance.conditions(), types::DRAIN_SUCCEEDED) else {
        return false;
    };
    if status::is_true(scope.instance.conditions(), types::DRAIN_SUCCEEDED) {
        return false;
    }
    let elapsed = Utc::now() - drain.last_transition_time;
    elapsed.num_seconds() >= i64::try_from(timeout).unwrap_or(i64::MAX)
}

async fn classify<S: ObjectStore>(
    scope: &Scope<'_, S>,
    machine: &Machine,
    cluster: &Cluster,
    target: &str,
) -> Result<UpgradeRole, SkoError> {
    if !machine.is_control_plane() {
        return Ok(UpgradeRole::Worker);
    }
    if upgraded_control_planes(scope, cluster, target).await? == 0 {
        Ok(UpgradeRole::FirstControlPlane)
    } else {
        Ok(UpgradeRole::JoiningControlPlane)
    }
}

async fn upgraded_control_planes<S: ObjectStore>(
    scope: &Scope<'_, S>,
    cluster: &Cluster,
    target: &str,
) -> Result<usize, SkoError> {
    Ok(control_plane_machines(scope, cluster)
        .await?
        .iter()
        .filter(|m| m.has_version(target))
        .count())
}

async fn control_plane_machines<S: ObjectStore>(
    scope: &Scope<'_, S>,
    cluster: &Cluster,
) -> Result<Vec<Machine>, SkoError> {
    let cluster_name = cluster.metadata.name.as_deref().unwrap_or_default();
    let machines: Vec<Machine> = scope
        .ctx
        .store
        .list(scope.namespace(), &cluster_labels(cluster_name))
        .await?;
    Ok(machines
        .into_iter()
        .filter(|m| m.is_control_plane() && m.metadata.deletion_timestamp.is_none())
        .collect())
}

/// Whether every desired control plane member is at `target`. The desired
/// count comes from the control plane group, or the machines themselves
/// when the cluster has none.
async fn control_plane_upgraded<S: ObjectStore>(
    scope: &Scope<'_, S>,
    cluster: &Cluster,
    target: &str,
) -> Result<bool, SkoError> {
    let machines = control_plane_machines(scope, cluster).await?;
    let upgraded = machines.iter().filter(|m| m.has_version(target)).count();

    let mut desired = machines.len();
    if let Some(group_name) = cluster.spec.control_plane_ref.as_deref()
        && let Some(group) = scope
            .ctx
            .store
            .get::<ControlPlaneGroup>(scope.namespace(), group_name)
            .await?
    {
        desired = usize::try_from(group.spec.replicas).unwrap_or_default();
    }
    Ok(upgraded >= desired)
}
