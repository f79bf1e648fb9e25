//! Prometheus metrics for the sko operator.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

/// Labels for reconcile outcome counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    pub controller: String,
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ControllerLabels {
    pub controller: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PhaseLabels {
    pub phase: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StateLabels {
    pub state: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct LockLabels {
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ClusterLabels {
    pub cluster: String,
}

/// All Prometheus metrics for the operator.
pub struct Metrics {
    pub reconcile_total: Family<ReconcileLabels, Counter>,
    pub reconcile_duration_seconds: Family<ControllerLabels, Histogram>,
    pub provision_phase_duration_seconds: Family<PhaseLabels, Histogram>,
    pub instance_state_transitions_total: Family<StateLabels, Counter>,
    pub lock_operations_total: Family<LockLabels, Counter>,
    pub upgrades_completed_total: Family<ClusterLabels, Counter>,
}

const RECONCILE_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 60.0, 300.0,
];

/// Phases run remote downloads and installs; they take seconds to minutes.
const PHASE_DURATION_BUCKETS: &[f64] = &[
    0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0,
];

impl Metrics {
    /// Create and register all metrics with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let reconcile_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "sko_reconcile",
            "Total number of reconcile calls",
            reconcile_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<ControllerLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(RECONCILE_BUCKETS.iter().copied())
            });
        registry.register(
            "sko_reconcile_duration_seconds",
            "Duration of reconcile calls in seconds",
            reconcile_duration_seconds.clone(),
        );

        let provision_phase_duration_seconds =
            Family::<PhaseLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(PHASE_DURATION_BUCKETS.iter().copied())
            });
        registry.register(
            "sko_provision_phase_duration_seconds",
            "Time spent running each provisioning phase in seconds",
            provision_phase_duration_seconds.clone(),
        );

        let instance_state_transitions_total = Family::<StateLabels, Counter>::default();
        registry.register(
            "sko_instance_state_transitions",
            "Total number of instance state transitions by target state",
            instance_state_transitions_total.clone(),
        );

        let lock_operations_total = Family::<LockLabels, Counter>::default();
        registry.register(
            "sko_lock_operations",
            "Total number of cluster lock attempts by outcome",
            lock_operations_total.clone(),
        );

        let upgrades_completed_total = Family::<ClusterLabels, Counter>::default();
        registry.register(
            "sko_upgrades_completed",
            "Total number of in-place upgrades that completed",
            upgrades_completed_total.clone(),
        );

        Self {
            reconcile_total,
            reconcile_duration_seconds,
            provision_phase_duration_seconds,
            instance_state_transitions_total,
            lock_operations_total,
            upgrades_completed_total,
        }
    }

    pub fn record_reconcile(&self, controller: &str, result: &str, duration_secs: f64) {
        self.reconcile_total
            .get_or_create(&ReconcileLabels {
                controller: controller.to_string(),
                result: result.to_string(),
            })
            .inc();
        self.reconcile_duration_seconds
            .get_or_create(&ControllerLabels {
                controller: controller.to_string(),
            })
            .observe(duration_secs);
    }

    pub fn observe_phase(&self, phase: &str, duration_secs: f64) {
        self.provision_phase_duration_seconds
            .get_or_create(&PhaseLabels {
                phase: phase.to_string(),
            })
            .observe(duration_secs);
    }

    pub fn record_state(&self, state: &str) {
        self.instance_state_transitions_total
            .get_or_create(&StateLabels {
                state: state.to_string(),
            })
            .inc();
    }

    pub fn record_lock(&self, result: &str) {
        self.lock_operations_total
            .get_or_create(&LockLabels {
                result: result.to_string(),
            })
            .inc();
    }

    pub fn record_upgrade_completed(&self, cluster: &str) {
        self.upgrades_completed_total
            .get_or_create(&ClusterLabels {
                cluster: cluster.to_string(),
            })
            .inc();
    }
}

/// Axum handler that encodes the registry as OpenMetrics text.
async fn metrics_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let mut buf = String::new();
    if encode(&mut buf, &registry).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics".to_string(),
        );
    }
    (StatusCode::OK, buf)
}

/// Start the metrics server on the given port.
pub async fn serve(port: u16, registry: Arc<Registry>) -> anyhow::Result<()> {
    use axum::Router;
    use axum::routing::get;
    use tokio::net::TcpListener;
    use tracing::info;

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("Metrics server listening on port {}", port);
    axum::serve(listener, app).await?;
    Ok(())
}
