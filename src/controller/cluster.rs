//! Cluster controller: readiness and the cluster side of in-place upgrades.

mod upgrade;

use std::sync::Arc;

use kube::runtime::controller::Action;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{Context, record_reconcile};
use crate::crd::condition::{reasons, types};
use crate::crd::{Cluster, ConditionSeverity, Instance, InstanceState};
use crate::error::SkoError;
use crate::status;
use crate::store::{ObjectStore, cluster_labels, object_name};

pub async fn reconcile<S: ObjectStore>(
    cluster: Arc<Cluster>,
    ctx: Arc<Context<S>>,
) -> Result<Action, SkoError> {
    let started = Instant::now();
    let result = reconcile_cluster(&cluster, &ctx).await;
    record_reconcile(&ctx.metrics, "cluster", started, &result);
    result
}

async fn reconcile_cluster<S: ObjectStore>(
    cluster: &Cluster,
    ctx: &Context<S>,
) -> Result<Action, SkoError> {
    let (_, name) = object_name(cluster);
    if cluster.metadata.deletion_timestamp.is_some() {
        debug!("Cluster {} is deleting", name);
        return Ok(Action::await_change());
    }

    let instances = active_instances(ctx, cluster).await?;
    let cluster = update_readiness(ctx, cluster.clone(), &instances).await?;

    match cluster.upgrade_target_version().map(str::to_string) {
        Some(target) => upgrade::reconcile(ctx, cluster, &target).await,
        None => Ok(Action::await_change()),
    }
}

/// Instances of the cluster that are not being deleted.
async fn active_instances<S: ObjectStore>(
    ctx: &Context<S>,
    cluster: &Cluster,
) -> Result<Vec<Instance>, SkoError> {
    let (namespace, name) = object_name(cluster);
    let instances: Vec<Instance> = ctx.store.list(&namespace, &cluster_labels(&name)).await?;
    Ok(instances.into_iter().filter(|i| !i.is_deleting()).collect())
}

/// The cluster is ready while every control plane instance is serving.
/// An upgrading control plane keeps serving.
fn control_plane_ready(instances: &[Instance]) -> Result<(), String> {
    let control_planes: Vec<&Instance> =
        instances.iter().filter(|i| i.is_control_plane()).collect();
    if control_planes.is_empty() {
        return Err("No control plane instances".to_string());
    }
    let waiting: Vec<&str> = control_planes
        .iter()
        .filter(|i| {
            !matches!(
                i.state(),
                Some(InstanceState::Running | InstanceState::InPlaceUpgrading)
            )
        })
        .filter_map(|i| i.metadata.name.as_deref())
        .collect();
    if waiting.is_empty() {
        Ok(())
    } else {
        Err(format!("Waiting for control plane instances {}", waiting.join(", ")))
    }
}

async fn update_readiness<S: ObjectStore>(
    ctx: &Context<S>,
    mut cluster: Cluster,
    instances: &[Instance],
) -> Result<Cluster, SkoError> {
    let readiness = control_plane_ready(instances);
    let status = cluster.status.get_or_insert_with(Default::default);
    let before = (
        status.ready,
        status::get(&status.conditions, types::READY).cloned(),
    );

    status.ready = readiness.is_ok();
    match readiness {
        Ok(()) => status::mark_true(&mut status.conditions, types::READY),
        Err(message) => status::mark_false(
            &mut status.conditions,
            types::READY,
            reasons::WAITING_FOR_CONTROL_PLANE,
            ConditionSeverity::Info,
            message,
        ),
    }

    let after = (
        status.ready,
        status::get(&status.conditions, types::READY).cloned(),
    );
    if after == before {
        return Ok(cluster);
    }
    info!(
        cluster = cluster.metadata.name.as_deref().unwrap_or_default(),
        ready = after.0,
        "Cluster readiness changed"
    );
    Ok(ctx.store.replace_status(&cluster).await?)
}
