//! Controllers for `Cluster`, `Machine` and `Instance`, their shared context
//! and error policy.

pub mod cluster;
pub mod instance;
pub mod machine;

use std::sync::Arc;
use std::time::Duration;

use kube::Resource;
use kube::runtime::controller::Action;
use tokio::time::Instant;
use tracing::{error, warn};

use crate::config::OperatorConfig;
use crate::error::SkoError;
use crate::exec::Connector;
use crate::nodes::NodeAccess;
use crate::status::EventPublisher;
use crate::store::ObjectStore;
use crate::telemetry::metrics::Metrics;

/// Delay used when waiting on another object or after an error.
pub const REQUEUE_WAIT: Duration = Duration::from_secs(30);

/// Delay used for short waits: workers behind the control plane, group
/// writes that lost a race.
pub const REQUEUE_SHORT: Duration = Duration::from_secs(15);

/// Delay between drain passes.
pub const REQUEUE_DRAIN: Duration = Duration::from_secs(20);

/// Shared context for all controllers.
pub struct Context<S> {
    pub store: S,
    pub connector: Arc<dyn Connector>,
    pub nodes: Arc<dyn NodeAccess>,
    pub events: Arc<dyn EventPublisher>,
    pub metrics: Arc<Metrics>,
    pub config: OperatorConfig,
}

/// Error policy shared by the controllers.
///
/// Transient errors requeue after [`REQUEUE_WAIT`]; terminal ones wait for
/// the object to change.
pub fn error_policy<K, S>(obj: Arc<K>, err: &SkoError, _ctx: Arc<Context<S>>) -> Action
where
    K: Resource,
{
    let name = obj.meta().name.as_deref().unwrap_or("unknown");
    if err.is_transient() {
        warn!("Reconcile of {} failed, retrying: {}", name, err);
        Action::requeue(REQUEUE_WAIT)
    } else {
        error!("Reconcile of {} failed permanently: {}", name, err);
        Action::await_change()
    }
}

/// Count a reconcile outcome and its duration.
pub(crate) fn record_reconcile(
    metrics: &Metrics,
    controller: &str,
    started: Instant,
    result: &Result<Action, SkoError>,
) {
    let outcome = match result {
        Ok(action) if *action == Action::await_change() => "success",
        Ok(_) => "requeue",
        Err(_) => "error",
    };
    metrics.record_reconcile(controller, outcome, started.elapsed().as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::memory::MemoryStore;
    use crate::testing;

    #[test]
    fn test_error_policy_requeues_transient_errors() {
        let ctx = testing::context(
            MemoryStore::new(),
            &testing::FakeFleet::default(),
            Arc::default(),
        );
        let obj = Arc::new(testing::cluster("demo"));

        let transient = SkoError::Store(StoreError::Api("connection reset".into()));
        assert_eq!(
            error_policy(obj.clone(), &transient, ctx.clone()),
            Action::requeue(REQUEUE_WAIT)
        );

        let terminal = SkoError::UnknownState("Rebooting".into());
        assert_eq!(
            error_policy(obj, &terminal, ctx),
            Action::await_change()
        );
    }
}
