//! Instance controller: provisioning state machine, node reference and the
//! in-place upgrade of a single host.
//!
//! A new instance moves `Pending -> Bootstrapping -> Running` while the
//! provisioning phases run over ssh. A deleted instance is cleaned with
//! `kubeadm reset` before its finalizer is released. Once running, an
//! upgrade annotation hands control to [`upgrade`].

mod noderef;
mod upgrade;

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{ObjectReference, Secret};
use kube::Resource;
use kube::runtime::controller::Action;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Context, REQUEUE_WAIT, record_reconcile};
use crate::crd::condition::{reasons, types};
use crate::crd::machine::provider_id;
use crate::crd::{
    Cluster, Condition, ConditionSeverity, INSTANCE_FINALIZER, Instance, InstanceState, Machine,
};
use crate::error::SkoError;
use crate::phases::{PhaseInput, ProvisionPhase, cleanup, run_all};
use crate::poll::{PollFailure, poll_immediate};
use crate::status;
use crate::store::{ObjectStore, object_name, owner_name};

/// Node health is re-read at this interval once the instance is running.
/// Workload cluster node events are not watched.
const HEALTH_RESYNC: Duration = Duration::from_secs(300);

/// Secret key holding the bootstrap data.
const BOOTSTRAP_DATA_KEY: &str = "value";

pub async fn reconcile<S: ObjectStore>(
    instance: Arc<Instance>,
    ctx: Arc<Context<S>>,
) -> Result<Action, SkoError> {
    let started = Instant::now();
    let result = reconcile_instance(&instance, &ctx).await;
    record_reconcile(&ctx.metrics, "instance", started, &result);
    result
}

async fn reconcile_instance<S: ObjectStore>(
    instance: &Instance,
    ctx: &Context<S>,
) -> Result<Action, SkoError> {
    let (namespace, name) = object_name(instance);
    let mut scope = Scope::new(ctx, instance.clone());

    // Cleanup runs from any state, failed ones included.
    if instance.is_deleting() {
        return reconcile_delete(&mut scope).await;
    }
    if let Some(reason) = instance
        .status
        .as_ref()
        .and_then(|s| s.failure_reason.as_deref())
    {
        debug!("Instance {} has failure reason {}, not advancing", name, reason);
        return Ok(Action::await_change());
    }
    if instance.state() == Some(InstanceState::Unknown) {
        return scope
            .fail(SkoError::UnknownState(format!(
                "instance {namespace}/{name} has an unrecognized state"
            )))
            .await;
    }

    let Some(machine_name) = owner_name(instance, "Machine") else {
        return scope
            .fail(SkoError::InvalidConfiguration(
                "instance has no owning Machine".to_string(),
            ))
            .await;
    };
    let Some(mut machine) = ctx.store.get::<Machine>(&namespace, &machine_name).await? else {
        return scope
            .fail(SkoError::MissingObject(format!(
                "owning Machine {machine_name} not found"
            )))
            .await;
    };
    let Some(cluster) = ctx
        .store
        .get::<Cluster>(&namespace, &machine.spec.cluster_name)
        .await?
    else {
        return scope
            .fail(SkoError::MissingObject(format!(
                "Cluster {} not found",
                machine.spec.cluster_name
            )))
            .await;
    };

    reconcile_normal(&mut scope, &mut machine, &cluster).await
}

async fn reconcile_normal<S: ObjectStore>(
    scope: &mut Scope<'_, S>,
    machine: &mut Machine,
    cluster: &Cluster,
) -> Result<Action, SkoError> {
    if !has_finalizer(&scope.instance) {
        scope
            .instance
            .metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(INSTANCE_FINALIZER.to_string());
        scope.instance = scope.ctx.store.replace(&scope.instance).await?;
    }

    if scope.instance.state().is_none() {
        scope.set_state(InstanceState::Pending);
        scope.persist().await?;
    }

    match scope.instance.state() {
        Some(InstanceState::Pending | InstanceState::Bootstrapping) => {
            if let Some(action) = provision(scope, machine, cluster).await? {
                return Ok(action);
            }
        }
        Some(InstanceState::Running | InstanceState::InPlaceUpgrading) => {}
        state => {
            warn!(
                "Instance {} is in state {:?} without a deletion request",
                scope.name(),
                state
            );
            return Ok(Action::await_change());
        }
    }

    if let Some(action) = noderef::reconcile(scope, machine).await? {
        return Ok(action);
    }

    if let Some(target) = scope.instance.upgrade_target_version().map(str::to_string) {
        return upgrade::reconcile(scope, machine, cluster, &target).await;
    }

    if scope.instance.state() == Some(InstanceState::InPlaceUpgrading) {
        // The upgrade annotation was stripped before this instance finished.
        scope.set_state(InstanceState::Running);
        scope.persist().await?;
    }
    Ok(Action::requeue(HEALTH_RESYNC))
}

/// Run the provisioning phases. Returns an action when the instance has to
/// wait before it can make progress.
async fn provision<S: ObjectStore>(
    scope: &mut Scope<'_, S>,
    machine: &Machine,
    cluster: &Cluster,
) -> Result<Option<Action>, SkoError> {
    let Some(version) = machine.spec.version.clone() else {
        return scope
            .fail(SkoError::InvalidConfiguration(
                "owning Machine has no spec.version".to_string(),
            ))
            .await
            .map(Some);
    };
    let bootstrap_data = match bootstrap_data(scope, machine).await {
        Ok(Some(data)) => data,
        Ok(None) => {
            info!("Waiting for bootstrap data of instance {}", scope.name());
            return Ok(Some(Action::requeue(REQUEUE_WAIT)));
        }
        Err(e) if !e.is_transient() => return scope.fail(e).await.map(Some),
        Err(e) => return Err(e),
    };
    let provider_id = machine
        .spec
        .provider_id
        .clone()
        .unwrap_or_else(|| provider_id(&machine.spec.cluster_name, scope.name()));

    scope.set_state(InstanceState::Bootstrapping);
    scope.persist().await?;

    let ctx = scope.ctx;
    let runner = ctx.connector.connect(&scope.instance).await?;
    for phase in ProvisionPhase::ALL {
        if status::is_true(scope.instance.conditions(), phase.condition()) {
            debug!("Phase {} already done on {}", phase, scope.name());
            continue;
        }

        let started = Instant::now();
        let result = {
            let input = PhaseInput {
                instance: &scope.instance,
                cluster,
                version: &version,
                provider_id: &provider_id,
                bootstrap_data: &bootstrap_data,
            };
            let runner = runner.as_ref();
            let input = &input;
            poll_immediate(
                ctx.config.instance_poll_interval,
                ctx.config.instance_poll_timeout,
                SkoError::is_transient,
                move || phase.run(runner, input),
            )
            .await
        };
        ctx.metrics
            .observe_phase(phase.as_str(), started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                info!(instance = scope.name(), phase = phase.as_str(), "Phase completed");
                status::mark_true(scope.conditions_mut(), phase.condition());
                scope.persist().await?;
            }
            Err(PollFailure::Aborted(e)) => {
                status::mark_false(
                    scope.conditions_mut(),
                    phase.condition(),
                    phase.failure_reason(),
                    phase.severity(),
                    e.to_string(),
                );
                return scope.fail(e).await.map(Some);
            }
            Err(PollFailure::TimedOut(e)) => {
                status::mark_false(
                    scope.conditions_mut(),
                    phase.condition(),
                    phase.failure_reason(),
                    phase.severity(),
                    e.last.clone(),
                );
                scope.persist().await?;
                scope
                    .warning(
                        phase.failure_reason(),
                        &format!("Phase {phase} failed on {}: {}", runner.host(), e.last),
                    )
                    .await;
                return Err(SkoError::Phase {
                    phase: phase.to_string(),
                    source: e,
                });
            }
        }
    }

    scope.set_state(InstanceState::Running);
    scope.persist().await?;
    Ok(None)
}

/// Contents of the machine's bootstrap data secret, once it exists.
async fn bootstrap_data<S: ObjectStore>(
    scope: &Scope<'_, S>,
    machine: &Machine,
) -> Result<Option<String>, SkoError> {
    let Some(secret_name) = machine.spec.bootstrap.data_secret_name.as_deref() else {
        return Ok(None);
    };
    let Some(secret) = scope
        .ctx
        .store
        .get::<Secret>(scope.namespace(), secret_name)
        .await?
    else {
        return Ok(None);
    };
    let Some(value) = secret
        .data
        .as_ref()
        .and_then(|d| d.get(BOOTSTRAP_DATA_KEY))
    else {
        return Ok(None);
    };
    String::from_utf8(value.0.clone()).map(Some).map_err(|_| {
        SkoError::InvalidConfiguration(format!(
            "bootstrap data secret {secret_name} is not valid UTF-8"
        ))
    })
}

/// Clean the host and release the finalizer.
async fn reconcile_delete<S: ObjectStore>(scope: &mut Scope<'_, S>) -> Result<Action, SkoError> {
    if !has_finalizer(&scope.instance) {
        return Ok(Action::await_change());
    }

    if let Some(cluster_name) = scope.instance.cluster_name()
        && let Some(cluster) = scope
            .ctx
            .store
            .get::<Cluster>(scope.namespace(), cluster_name)
            .await?
        && cluster.spec.paused
    {
        info!("Cluster {} is paused, deferring cleanup of {}", cluster_name, scope.name());
        return Ok(Action::requeue(REQUEUE_WAIT));
    }

    if scope.instance.state() != Some(InstanceState::Cleaned) {
        if !status::has(scope.instance.conditions(), types::INSTANCE_DELETING_BOOTSTRAPPED) {
            status::mark_false(
                scope.conditions_mut(),
                types::INSTANCE_DELETING_BOOTSTRAPPED,
                reasons::CLEANING,
                ConditionSeverity::Info,
                "Cleaning the node before deletion",
            );
        }
        scope.set_state(InstanceState::Cleaning);
        scope.persist().await?;

        let runner = scope.ctx.connector.connect(&scope.instance).await?;
        if let Err(e) = run_all(runner.as_ref(), &cleanup::commands()).await {
            status::mark_false(
                scope.conditions_mut(),
                types::INSTANCE_DELETING_BOOTSTRAPPED,
                reasons::CLEAR_ENVIRONMENT_FAILED,
                ConditionSeverity::Warning,
                e.to_string(),
            );
            scope.persist().await?;
            scope
                .warning(
                    reasons::CLEAR_ENVIRONMENT_FAILED,
                    &format!("Failed to clean {}: {e}", runner.host()),
                )
                .await;
            return Err(e);
        }

        status::mark_true(scope.conditions_mut(), types::INSTANCE_DELETING_BOOTSTRAPPED);
        scope.set_state(InstanceState::Cleaned);
        scope.persist().await?;
        info!("Cleaned instance {}", scope.name());
    }

    scope
        .instance
        .metadata
        .finalizers
        .get_or_insert_with(Vec::new)
        .retain(|f| f != INSTANCE_FINALIZER);
    match scope.ctx.store.replace(&scope.instance).await {
        Ok(_) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }
    Ok(Action::await_change())
}

fn has_finalizer(instance: &Instance) -> bool {
    instance
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|f| f == INSTANCE_FINALIZER))
}

/// The instance being reconciled and the context it is written through.
pub(super) struct Scope<'a, S> {
    ctx: &'a Context<S>,
    instance: Instance,
}

impl<'a, S: ObjectStore> Scope<'a, S> {
    const fn new(ctx: &'a Context<S>, instance: Instance) -> Self {
        Self { ctx, instance }
    }

    fn name(&self) -> &str {
        self.instance.metadata.name.as_deref().unwrap_or_default()
    }

    fn namespace(&self) -> &str {
        self.instance
            .metadata
            .namespace
            .as_deref()
            .unwrap_or_default()
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.instance.status_mut().conditions
    }

    /// Move to `state` if the transition graph allows it.
    fn set_state(&mut self, state: InstanceState) {
        let from = self.instance.state();
        if from == Some(state) {
            return;
        }
        if !InstanceState::can_transition(from, state) {
            warn!(
                "Refusing state change {:?} -> {} on instance {}",
                from,
                state,
                self.name()
            );
            return;
        }
        info!(instance = self.name(), "State {:?} -> {}", from, state);
        self.instance.status_mut().state = Some(state);
        self.ctx.metrics.record_state(&state.to_string());
    }

    /// Write the status and pick up the new resource version.
    async fn persist(&mut self) -> Result<(), SkoError> {
        self.instance = self.ctx.store.replace_status(&self.instance).await?;
        Ok(())
    }

    fn object_ref(&self) -> ObjectReference {
        self.instance.object_ref(&())
    }

    async fn event(&self, reason: &str, message: &str) {
        self.ctx
            .events
            .publish(&self.object_ref(), reason, message)
            .await;
    }

    async fn warning(&self, reason: &str, message: &str) {
        self.ctx
            .events
            .publish_warning(&self.object_ref(), reason, message)
            .await;
    }

    /// Record a terminal error. The instance is not advanced until an
    /// operator clears `status.failureReason`.
    async fn fail(&mut self, err: SkoError) -> Result<Action, SkoError> {
        let reason = err.failure_reason();
        let message = err.to_string();
        warn!("Instance {}: {}", self.name(), message);
        let status = self.instance.status_mut();
        status.failure_reason = Some(reason.to_string());
        status.failure_message = Some(message.clone());
        self.persist().await?;
        self.warning(reason, &message).await;
        Ok(Action::await_change())
    }
}
