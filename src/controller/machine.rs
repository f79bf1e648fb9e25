//! Machine controller: assigns a host from the cluster inventory and keeps
//! the machine status in step with its instance.

use std::collections::BTreeSet;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;
use kube::api::ObjectMeta;
use kube::runtime::controller::Action;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Context, REQUEUE_WAIT, record_reconcile};
use crate::crd::condition::reasons;
use crate::crd::machine::provider_id;
use crate::crd::{
    AuthSpec, Cluster, HostSpec, Instance, InstanceAuth, InstanceSpec, InstanceState, Machine,
    MachineStatus,
};
use crate::error::SkoError;
use crate::store::{ObjectStore, cluster_labels, object_name};

const DEFAULT_SSH_USER: &str = "root";
const DEFAULT_SSH_PORT: u16 = 22;

pub async fn reconcile<S: ObjectStore>(
    machine: Arc<Machine>,
    ctx: Arc<Context<S>>,
) -> Result<Action, SkoError> {
    let started = Instant::now();
    let result = reconcile_machine(&machine, &ctx).await;
    record_reconcile(&ctx.metrics, "machine", started, &result);
    result
}

async fn reconcile_machine<S: ObjectStore>(
    machine: &Machine,
    ctx: &Context<S>,
) -> Result<Action, SkoError> {
    let (namespace, name) = object_name(machine);

    if machine.metadata.deletion_timestamp.is_some() {
        debug!("Machine {} is deleting, instance cleanup is handled by its finalizer", name);
        return Ok(Action::await_change());
    }
    if machine
        .status
        .as_ref()
        .is_some_and(|s| s.failure_reason.is_some())
    {
        debug!("Machine {} has a failure reason, skipping", name);
        return Ok(Action::await_change());
    }

    let Some(cluster) = ctx
        .store
        .get::<Cluster>(&namespace, &machine.spec.cluster_name)
        .await?
    else {
        info!(
            "Waiting for cluster {} of machine {}",
            machine.spec.cluster_name, name
        );
        return Ok(Action::requeue(REQUEUE_WAIT));
    };
    if cluster.spec.paused {
        info!("Cluster {} is paused, skipping machine {}", machine.spec.cluster_name, name);
        return Ok(Action::requeue(REQUEUE_WAIT));
    }

    if machine.spec.version.is_none() {
        return fail(
            ctx,
            machine,
            "spec.version is required to provision the machine".to_string(),
        )
        .await;
    }

    let mut machine = machine.clone();
    if machine.spec.instance_id.is_none() {
        match assign_instance(ctx, &cluster, &machine).await? {
            Some(instance_name) => {
                machine.spec.provider_id =
                    Some(provider_id(&machine.spec.cluster_name, &instance_name));
                machine.spec.instance_id = Some(instance_name.clone());
                machine = ctx.store.replace(&machine).await?;
                info!("Assigned instance {} to machine {}", instance_name, name);
            }
            None => {
                info!("No free host for machine {}, waiting", name);
                return Ok(Action::requeue(REQUEUE_WAIT));
            }
        }
    }

    mirror_instance_status(ctx, &machine).await?;
    Ok(Action::await_change())
}

/// Find or create the instance backing `machine`. Returns `None` when the
/// inventory has no free host with the machine's role.
async fn assign_instance<S: ObjectStore>(
    ctx: &Context<S>,
    cluster: &Cluster,
    machine: &Machine,
) -> Result<Option<String>, SkoError> {
    let (namespace, name) = object_name(machine);

    // An instance created by an earlier reconcile that failed to record it.
    if ctx.store.get::<Instance>(&namespace, &name).await?.is_some() {
        return Ok(Some(name));
    }

    let existing: Vec<Instance> = ctx
        .store
        .list(&namespace, &cluster_labels(&machine.spec.cluster_name))
        .await?;
    let used: BTreeSet<&str> = existing
        .iter()
        .map(|i| i.spec.internal_address.as_str())
        .collect();

    let Some(host) = cluster
        .spec
        .hosts
        .iter()
        .find(|h| h.has_role(machine.role()) && !used.contains(h.internal_address.as_str()))
    else {
        return Ok(None);
    };

    let instance = new_instance(machine, host, &cluster.spec.auth);
    match ctx.store.create(&instance).await {
        Ok(_) => info!("Created instance {} on host {}", name, host.address),
        Err(e) if e.is_already_exists() => debug!("Instance {} already exists", name),
        Err(e) => return Err(e.into()),
    }
    Ok(Some(name))
}

fn new_instance(machine: &Machine, host: &HostSpec, cluster_auth: &AuthSpec) -> Instance {
    let host_auth = host.auth.as_ref();
    let user = host_auth
        .and_then(|a| a.user.clone())
        .or_else(|| cluster_auth.user.clone())
        .unwrap_or_else(|| DEFAULT_SSH_USER.to_string());
    let port = host_auth
        .and_then(|a| a.port)
        .or(cluster_auth.port)
        .unwrap_or(DEFAULT_SSH_PORT);
    let private_key_secret = host_auth
        .and_then(|a| a.private_key_secret.clone())
        .or_else(|| cluster_auth.private_key_secret.clone());

    Instance {
        metadata: ObjectMeta {
            name: machine.metadata.name.clone(),
            namespace: machine.metadata.namespace.clone(),
            labels: machine.metadata.labels.clone(),
            owner_references: Some(vec![OwnerReference {
                api_version: Machine::api_version(&()).to_string(),
                kind: Machine::kind(&()).to_string(),
                name: machine.metadata.name.clone().unwrap_or_default(),
                uid: machine.metadata.uid.clone().unwrap_or_default(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            }]),
            ..ObjectMeta::default()
        },
        spec: InstanceSpec {
            name: host.name.clone(),
            address: host.address.clone(),
            internal_address: host.internal_address.clone(),
            port,
            user,
            auth: InstanceAuth { private_key_secret },
            arch: host.arch.clone(),
            roles: host.roles.clone(),
        },
        status: None,
    }
}

/// Copy readiness and the node reference from the instance.
async fn mirror_instance_status<S: ObjectStore>(
    ctx: &Context<S>,
    machine: &Machine,
) -> Result<(), SkoError> {
    let (namespace, _) = object_name(machine);
    let Some(instance_id) = machine.spec.instance_id.as_deref() else {
        return Ok(());
    };
    let Some(instance) = ctx.store.get::<Instance>(&namespace, instance_id).await? else {
        warn!("Instance {} of machine {:?} not found", instance_id, machine.metadata.name);
        return Ok(());
    };

    let ready = instance.state() == Some(InstanceState::Running);
    let node_ref = instance.status.as_ref().and_then(|s| s.node_ref.clone());
    let current = machine.status.clone().unwrap_or_default();
    if current.ready == ready && current.node_ref == node_ref {
        return Ok(());
    }

    let mut updated = machine.clone();
    updated.status = Some(MachineStatus {
        ready,
        node_ref,
        ..current
    });
    ctx.store.replace_status(&updated).await?;
    Ok(())
}

/// Record a terminal configuration error on the machine.
async fn fail<S: ObjectStore>(
    ctx: &Context<S>,
    machine: &Machine,
    message: String,
) -> Result<Action, SkoError> {
    warn!("Machine {:?}: {}", machine.metadata.name, message);
    let mut updated = machine.clone();
    let status = updated.status.get_or_insert_with(MachineStatus::default);
    status.failure_reason = Some(reasons::INVALID_CONFIGURATION.to_string());
    status.failure_message = Some(message.clone());
    ctx.store.replace_status(&updated).await?;
    ctx.events
        .publish_warning(
            &machine.object_ref(&()),
            reasons::INVALID_CONFIGURATION,
            &message,
        )
        .await;
    Ok(Action::await_change())
}
