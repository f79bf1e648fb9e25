//! sko - Kubernetes operator for clusters built from SSH-reachable machines.
//!
//! Watches `Cluster`, `Machine` and `Instance` resources. Instances are
//! provisioned over ssh with kubeadm, cleaned on deletion, and upgraded in
//! place when the cluster carries an upgrade target version.

mod config;
mod controller;
mod crd;
mod error;
mod exec;
mod lock;
mod node_health;
mod nodes;
mod phases;
mod poll;
mod status;
mod store;
mod telemetry;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use kube::runtime::Controller;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::{Api, Client};
use tracing::{debug, error, info};

use config::OperatorConfig;
use controller::Context;
use crd::{Cluster, Instance, Machine};
use store::{KubeStore, StoreObject};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("BUILD_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");

#[tokio::main]
async fn main() {
    if std::env::args().nth(1).as_deref() == Some("crd") {
        if let Err(e) = print_crds() {
            eprintln!("Failed to render CRDs: {e}");
            std::process::exit(1);
        }
        return;
    }

    if let Err(e) = init_tracing() {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    info!(
        "Starting sko v{} (commit: {}, build: {})",
        VERSION, COMMIT, BUILD_DATE
    );

    if let Err(e) = run().await {
        error!("Operator failed: {}", e);
        std::process::exit(1);
    }
}

/// Print all CRDs as a multi-document YAML stream.
fn print_crds() -> Result<()> {
    for crd in crd::all_crds() {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}

/// Initialize tracing subscriber with JSON format for production.
fn init_tracing() -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| anyhow::anyhow!("Failed to initialize log filter: {e}"))?;

    fmt()
        .with_env_filter(filter)
        .json()
        .with_target(true)
        .init();

    Ok(())
}

/// Api for `K`, limited to the watch namespace when one is configured.
fn api<K: StoreObject>(client: &Client, namespace: Option<&str>) -> Api<K> {
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

async fn run() -> Result<()> {
    let config = OperatorConfig::load()?;
    info!(
        poll_interval = ?config.instance_poll_interval,
        poll_timeout = ?config.instance_poll_timeout,
        namespace = config.watch_namespace.as_deref().unwrap_or("*"),
        "Loaded configuration"
    );

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let mut registry = prometheus_client::registry::Registry::default();
    let metrics = Arc::new(telemetry::metrics::Metrics::new(&mut registry));
    let registry = Arc::new(registry);

    let health_state = telemetry::health::HealthState::new();
    let health_state_clone = health_state.clone();
    let health_port = config.health_port;
    tokio::spawn(async move {
        if let Err(e) = telemetry::health::serve(health_port, health_state_clone).await {
            error!("Health server failed: {}", e);
        }
    });

    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = telemetry::metrics::serve(metrics_port, registry).await {
            error!("Metrics server failed: {}", e);
        }
    });

    let namespace = config.watch_namespace.clone();
    let ns = namespace.as_deref();
    let ctx = Arc::new(Context {
        store: KubeStore::new(client.clone()),
        connector: Arc::new(exec::ssh::SshConnector::new(
            client.clone(),
            config.ssh_key_dir.clone(),
            config.ssh_connect_timeout,
            config.command_timeout,
        )),
        nodes: Arc::new(nodes::KubeNodeAccess::new(client.clone())),
        events: Arc::new(status::KubeEvents::new(client.clone())),
        metrics,
        config,
    });

    let clusters = Controller::new(api::<Cluster>(&client, ns), Config::default())
        .watches(
            api::<Instance>(&client, ns),
            Config::default(),
            |instance: Instance| {
                let namespace = instance.metadata.namespace.clone().unwrap_or_default();
                instance
                    .cluster_name()
                    .map(|name| ObjectRef::<Cluster>::new(name).within(&namespace))
            },
        )
        .shutdown_on_signal()
        .run(controller::cluster::reconcile, controller::error_policy, ctx.clone())
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => debug!("Reconciled cluster {}: {:?}", obj.name, action),
                Err(e) => error!("Cluster reconcile failed: {:?}", e),
            }
        });

    let machines = Controller::new(api::<Machine>(&client, ns), Config::default())
        .owns(api::<Instance>(&client, ns), Config::default())
        .shutdown_on_signal()
        .run(controller::machine::reconcile, controller::error_policy, ctx.clone())
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => debug!("Reconciled machine {}: {:?}", obj.name, action),
                Err(e) => error!("Machine reconcile failed: {:?}", e),
            }
        });

    let instances = Controller::new(api::<Instance>(&client, ns), Config::default())
        .watches(
            api::<Machine>(&client, ns),
            Config::default(),
            |machine: Machine| {
                let namespace = machine.metadata.namespace.clone().unwrap_or_default();
                machine
                    .spec
                    .instance_id
                    .map(|id| ObjectRef::<Instance>::new(&id).within(&namespace))
            },
        )
        .shutdown_on_signal()
        .run(controller::instance::reconcile, controller::error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => debug!("Reconciled instance {}: {:?}", obj.name, action),
                Err(e) => error!("Instance reconcile failed: {:?}", e),
            }
        });

    health_state.set_ready(true);
    info!("Starting Cluster, Machine and Instance controllers");
    futures::join!(clusters, machines, instances);

    Ok(())
}
