//! Cluster side of an in-place upgrade.
//!
//! Every reconcile walks the steps from the start. Steps that already did
//! their work pass straight through, so a rollout resumes wherever the last
//! reconcile stopped. Instances do the actual upgrade in their own
//! controller; this side only fans out the annotation, waits for the
//! results and cleans up.

use std::fmt;
use std::time::Duration;

use kube::Resource;
use kube::runtime::controller::Action;
use tracing::{debug, info, warn};

use super::active_instances;
use crate::controller::{Context, REQUEUE_SHORT, REQUEUE_WAIT};
use crate::crd::condition::{reasons, types};
use crate::crd::{
    Cluster, ConditionSeverity, ControlPlaneGroup, Instance, Machine, MachineDeployment,
    MachineSet, UPGRADE_TARGET_VERSION_ANNOTATION,
};
use crate::error::SkoError;
use crate::lock::ClusterLock;
use crate::status;
use crate::store::{ObjectStore, StoreObject, cluster_labels, is_owned_by, owner_name};

/// Conditions that only exist while a rollout is in progress.
const INSTANCE_UPGRADE_CONDITIONS: [&str; 3] = [
    types::IN_PLACE_UPGRADE_BINARIES_READY,
    types::IN_PLACE_UPGRADED,
    types::DRAIN_SUCCEEDED,
];
const CLUSTER_UPGRADE_CONDITIONS: [&str; 2] = [
    types::INSTANCES_UPGRADE_ANNOTATED,
    types::ALL_INSTANCES_UPGRADE_COMPLETED,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeStep {
    Pause,
    AnnotateControlPlane,
    AnnotateWorkers,
    Check,
    PatchGroupVersions,
    Strip,
    Unpause,
}

impl UpgradeStep {
    pub const ALL: [Self; 7] = [
        Self::Pause,
        Self::AnnotateControlPlane,
        Self::AnnotateWorkers,
        Self::Check,
        Self::PatchGroupVersions,
        Self::Strip,
        Self::Unpause,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pause => "Pause",
            Self::AnnotateControlPlane => "AnnotateControlPlane",
            Self::AnnotateWorkers => "AnnotateWorkers",
            Self::Check => "Check",
            Self::PatchGroupVersions => "PatchGroupVersions",
            Self::Strip => "Strip",
            Self::Unpause => "Unpause",
        }
    }

    async fn run<S: ObjectStore>(self, rollout: &mut Rollout<'_, S>) -> Result<Next, SkoError> {
        match self {
            Self::Pause => rollout.pause().await,
            Self::AnnotateControlPlane => rollout.annotate_control_plane().await,
            Self::AnnotateWorkers => rollout.annotate_workers().await,
            Self::Check => rollout.check().await,
            Self::PatchGroupVersions => rollout.patch_group_versions().await,
            Self::Strip => rollout.strip().await,
            Self::Unpause => rollout.unpause().await,
        }
    }
}

impl fmt::Display for UpgradeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Continue,
    Requeue(Duration),
}

pub(super) async fn reconcile<S: ObjectStore>(
    ctx: &Context<S>,
    cluster: Cluster,
    target: &str,
) -> Result<Action, SkoError> {
    let mut rollout = Rollout {
        ctx,
        cluster,
        target: target.to_string(),
    };
    for step in UpgradeStep::ALL {
        if let Next::Requeue(after) = step.run(&mut rollout).await? {
            debug!(
                cluster = rollout.name(),
                step = step.as_str(),
                "Upgrade waiting, requeue in {:?}",
                after
            );
            return Ok(Action::requeue(after));
        }
    }
    Ok(Action::await_change())
}

struct Rollout<'a, S> {
    ctx: &'a Context<S>,
    cluster: Cluster,
    target: String,
}

impl<S: ObjectStore> Rollout<'_, S> {
    fn name(&self) -> &str {
        self.cluster.metadata.name.as_deref().unwrap_or_default()
    }

    fn namespace(&self) -> &str {
        self.cluster
            .metadata
            .namespace
            .as_deref()
            .unwrap_or_default()
    }

    fn conditions_mut(&mut self) -> &mut Vec<crate::crd::Condition> {
        &mut self
            .cluster
            .status
            .get_or_insert_with(Default::default)
            .conditions
    }

    fn conditions(&self) -> &[crate::crd::Condition] {
        self.cluster
            .status
            .as_ref()
            .map_or(&[], |s| s.conditions.as_slice())
    }

    async fn persist_status(&mut self) -> Result<(), SkoError> {
        self.cluster = self.ctx.store.replace_status(&self.cluster).await?;
        Ok(())
    }

    async fn pause(&mut self) -> Result<Next, SkoError> {
        if self.cluster.spec.paused {
            return Ok(Next::Continue);
        }
        self.cluster.spec.paused = true;
        self.cluster = self.ctx.store.replace(&self.cluster).await?;
        info!(cluster = self.name(), version = %self.target, "Starting in-place upgrade");
        self.ctx
            .events
            .publish(
                &self.cluster.object_ref(&()),
                "InPlaceUpgradeStarted",
                &format!("Upgrading cluster to {}", self.target),
            )
            .await;
        Ok(Next::Continue)
    }

    async fn annotate_control_plane(&mut self) -> Result<Next, SkoError> {
        let instances = active_instances(self.ctx, &self.cluster).await?;
        let control_planes: Vec<Instance> =
            instances.into_iter().filter(Instance::is_control_plane).collect();
        if let Next::Requeue(after) = self.annotate(control_planes).await {
            return Ok(Next::Requeue(after));
        }

        if !status::has(self.conditions(), types::INSTANCES_UPGRADE_ANNOTATED) {
            status::mark_false(
                self.conditions_mut(),
                types::INSTANCES_UPGRADE_ANNOTATED,
                reasons::WAITING_FOR_INSTANCES_UPGRADE,
                ConditionSeverity::Info,
                "Waiting for the control plane to upgrade",
            );
            self.persist_status().await?;
        }
        Ok(Next::Continue)
    }

    async fn annotate_workers(&mut self) -> Result<Next, SkoError> {
        let instances = active_instances(self.ctx, &self.cluster).await?;
        let (control_planes, workers): (Vec<Instance>, Vec<Instance>) =
            instances.into_iter().partition(Instance::is_control_plane);

        let behind: Vec<&str> = control_planes
            .iter()
            .filter(|i| i.kubelet_version() != self.target)
            .filter_map(|i| i.metadata.name.as_deref())
            .collect();
        if !behind.is_empty() {
            info!(
                cluster = self.name(),
                "Control plane instances not yet at {}: {}",
                self.target,
                behind.join(", ")
            );
            return Ok(Next::Requeue(REQUEUE_WAIT));
        }

        if let Next::Requeue(after) = self.annotate(workers).await {
            return Ok(Next::Requeue(after));
        }
        if !status::is_true(self.conditions(), types::INSTANCES_UPGRADE_ANNOTATED) {
            status::mark_true(self.conditions_mut(), types::INSTANCES_UPGRADE_ANNOTATED);
            self.persist_status().await?;
        }
        Ok(Next::Continue)
    }

    /// Put the target annotation on every instance that lacks it.
    async fn annotate(&self, instances: Vec<Instance>) -> Next {
        for mut instance in instances {
            if instance.upgrade_target_version() == Some(self.target.as_str()) {
                continue;
            }
            instance
                .metadata
                .annotations
                .get_or_insert_with(Default::default)
                .insert(UPGRADE_TARGET_VERSION_ANNOTATION.to_string(), self.target.clone());
            let name = instance.metadata.name.clone().unwrap_or_default();
            match self.ctx.store.replace(&instance).await {
                Ok(_) => info!(cluster = self.name(), instance = %name, "Annotated for upgrade"),
                Err(e) => {
                    warn!("Failed to annotate instance {}: {}", name, e);
                    return Next::Requeue(REQUEUE_SHORT);
                }
            }
        }
        Next::Continue
    }

    async fn check(&mut self) -> Result<Next, SkoError> {
        let instances = active_instances(self.ctx, &self.cluster).await?;
        let unfinished: Vec<String> = instances
            .iter()
            .filter_map(|i| self.unfinished(i))
            .collect();

        if unfinished.is_empty() {
            if !status::is_true(self.conditions(), types::ALL_INSTANCES_UPGRADE_COMPLETED) {
                status::mark_true(self.conditions_mut(), types::ALL_INSTANCES_UPGRADE_COMPLETED);
                self.persist_status().await?;
            }
            return Ok(Next::Continue);
        }

        let message = unfinished.join("; ");
        let before = status::get(self.conditions(), types::ALL_INSTANCES_UPGRADE_COMPLETED)
            .map(|c| (c.status, c.message.clone()));
        status::mark_false(
            self.conditions_mut(),
            types::ALL_INSTANCES_UPGRADE_COMPLETED,
            reasons::WAITING_FOR_INSTANCES_UPGRADE,
            ConditionSeverity::Info,
            message.clone(),
        );
        let after = status::get(self.conditions(), types::ALL_INSTANCES_UPGRADE_COMPLETED)
            .map(|c| (c.status, c.message.clone()));
        if before != after {
            self.persist_status().await?;
        }
        self.ctx
            .events
            .publish_warning(
                &self.cluster.object_ref(&()),
                "InstanceInPlaceUpgradeUnfinished",
                &message,
            )
            .await;
        Ok(Next::Requeue(REQUEUE_WAIT))
    }

    /// Why `instance` has not finished the upgrade, if it has not.
    fn unfinished(&self, instance: &Instance) -> Option<String> {
        let name = instance.metadata.name.as_deref().unwrap_or_default();
        let conditions = instance.conditions();
        let problem = if instance.upgrade_target_version() != Some(self.target.as_str()) {
            "not annotated".to_string()
        } else if !status::is_true(conditions, types::IN_PLACE_UPGRADED) {
            "upgrade not finished".to_string()
        } else if status::is_false(conditions, types::NODE_HEALTHY) {
            "node is not healthy".to_string()
        } else if instance.kubelet_version() != self.target {
            format!(
                "kubelet reports {} instead of {}",
                instance.kubelet_version(),
                self.target
            )
        } else {
            return None;
        };
        Some(format!("instance {name}: {problem}"))
    }

    async fn patch_group_versions(&mut self) -> Result<Next, SkoError> {
        let namespace = self.namespace().to_string();
        let labels = cluster_labels(self.name());
        let machines: Vec<Machine> = self.ctx.store.list(&namespace, &labels).await?;
        let upgraded: Vec<&Machine> = machines
            .iter()
            .filter(|m| m.has_version(&self.target))
            .collect();

        if let Some(group_name) = self.cluster.spec.control_plane_ref.clone()
            && upgraded
                .iter()
                .any(|m| is_owned_by(*m, "ControlPlaneGroup", &group_name))
        {
            let Some(mut group) = self
                .ctx
                .store
                .get::<ControlPlaneGroup>(&namespace, &group_name)
                .await?
            else {
                warn!("Control plane group {} not found", group_name);
                return Ok(Next::Requeue(REQUEUE_WAIT));
            };
            if group.spec.version != self.target {
                group.spec.version = self.target.clone();
                if let Next::Requeue(after) = self.write(&group).await {
                    return Ok(Next::Requeue(after));
                }
            }
        }

        let sets: Vec<MachineSet> = self.ctx.store.list(&namespace, &labels).await?;
        for mut set in sets {
            let set_name = set.metadata.name.clone().unwrap_or_default();
            if !upgraded
                .iter()
                .any(|m| is_owned_by(*m, "MachineSet", &set_name))
            {
                continue;
            }
            if set.spec.version.as_deref() != Some(self.target.as_str()) {
                set.spec.version = Some(self.target.clone());
                if let Next::Requeue(after) = self.write(&set).await {
                    return Ok(Next::Requeue(after));
                }
            }

            let Some(deployment_name) = owner_name(&set, "MachineDeployment") else {
                continue;
            };
            let Some(mut deployment) = self
                .ctx
                .store
                .get::<MachineDeployment>(&namespace, &deployment_name)
                .await?
            else {
                continue;
            };
            if deployment.spec.version.as_deref() != Some(self.target.as_str()) {
                deployment.spec.version = Some(self.target.clone());
                if let Next::Requeue(after) = self.write(&deployment).await {
                    return Ok(Next::Requeue(after));
                }
            }
        }
        Ok(Next::Continue)
    }

    async fn write<K: StoreObject>(&self, obj: &K) -> Next {
        let name = obj.meta().name.clone().unwrap_or_default();
        match self.ctx.store.replace(obj).await {
            Ok(_) => {
                info!(
                    cluster = self.name(),
                    object = %name,
                    version = %self.target,
                    "Patched group version"
                );
                Next::Continue
            }
            Err(e) => {
                warn!("Failed to patch version of {}: {}", name, e);
                Next::Requeue(REQUEUE_SHORT)
            }
        }
    }

    async fn strip(&mut self) -> Result<Next, SkoError> {
        let instances = active_instances(self.ctx, &self.cluster).await?;
        for instance in instances {
            if let Err(e) = self.strip_instance(instance).await {
                warn!("Failed to strip upgrade state: {}", e);
                return Ok(Next::Requeue(REQUEUE_SHORT));
            }
        }

        ClusterLock::new(&self.ctx.store)
            .with_metrics(&self.ctx.metrics)
            .unlock(&self.cluster)
            .await;

        if CLUSTER_UPGRADE_CONDITIONS
            .iter()
            .any(|c| status::has(self.conditions(), c))
        {
            for condition in CLUSTER_UPGRADE_CONDITIONS {
                status::delete(self.conditions_mut(), condition);
            }
            self.persist_status().await?;
        }
        Ok(Next::Continue)
    }

    async fn strip_instance(&self, mut instance: Instance) -> Result<(), SkoError> {
        let annotated = instance
            .metadata
            .annotations
            .as_mut()
            .and_then(|a| a.remove(UPGRADE_TARGET_VERSION_ANNOTATION))
            .is_some();
        if annotated {
            instance = self.ctx.store.replace(&instance).await?;
        }

        if INSTANCE_UPGRADE_CONDITIONS
            .iter()
            .any(|c| status::has(instance.conditions(), c))
        {
            let conditions = &mut instance.status_mut().conditions;
            for condition in INSTANCE_UPGRADE_CONDITIONS {
                status::delete(conditions, condition);
            }
            self.ctx.store.replace_status(&instance).await?;
        }
        Ok(())
    }

    async fn unpause(&mut self) -> Result<Next, SkoError> {
        if let Some(annotations) = self.cluster.metadata.annotations.as_mut() {
            annotations.remove(UPGRADE_TARGET_VERSION_ANNOTATION);
        }
        self.cluster.spec.paused = false;
        self.cluster = self.ctx.store.replace(&self.cluster).await?;

        info!(cluster = self.name(), version = %self.target, "In-place upgrade completed");
        self.ctx.metrics.record_upgrade_completed(self.name());
        self.ctx
            .events
            .publish(
                &self.cluster.object_ref(&()),
                "InPlaceUpgradeCompleted",
                &format!("Cluster upgraded to {}", self.target),
            )
            .await;
        Ok(Next::Continue)
    }
}
