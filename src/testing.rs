//! Fixtures and fakes shared by unit tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Node, NodeCondition, NodeSpec, NodeStatus, NodeSystemInfo, ObjectReference,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use prometheus_client::registry::Registry;

use crate::config::OperatorConfig;
use crate::controller::Context;
use crate::crd::condition::types;
use crate::crd::machine::provider_id;
use crate::crd::{
    ApiEndpoint, AuthSpec, Cluster, ClusterSpec, ContainerManagerSpec, ControlPlaneGroup,
    ControlPlaneGroupSpec, HostSpec, Instance, InstanceAuth, InstanceSpec, InstanceState,
    InstanceStatus, Machine, MachineDeployment, MachineDeploymentSpec, MachineSet,
    MachineSetSpec, MachineSpec, MachineStatus, NodeInfo, NodeRef, CLUSTER_NAME_LABEL,
    CONTROL_PLANE_LABEL, INSTANCE_FINALIZER, ROLE_CONTROL_PLANE, ROLE_WORKER,
};
use crate::crd::machine::Bootstrap;
use crate::error::{ExecError, NodeError};
use crate::exec::{CommandRunner, Connector};
use crate::nodes::{DrainOutcome, NodeAccess};
use crate::status::{self, EventPublisher};
use crate::store::memory::MemoryStore;
use crate::telemetry::metrics::Metrics;

pub const NAMESPACE: &str = "default";
pub const DEMO: &str = "demo";

pub fn control_plane_group_name(cluster: &str) -> String {
    format!("{cluster}-control-plane")
}

pub fn machine_deployment_name(cluster: &str) -> String {
    format!("{cluster}-workers")
}

pub fn machine_set_name(cluster: &str) -> String {
    format!("{cluster}-workers-7d9f")
}

/// `cp-N` hosts live at 10.0.0.1N, everything else at 10.0.0.2N.
fn address(name: &str) -> String {
    let index: u8 = name
        .rsplit('-')
        .next()
        .and_then(|i| i.parse().ok())
        .unwrap_or(0);
    let base = if name.starts_with("cp-") { 10 } else { 20 };
    format!("10.0.0.{}", base + index)
}

fn owner(kind: &str, name: &str) -> OwnerReference {
    OwnerReference {
        api_version: "sko.io/v1alpha1".to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        uid: format!("uid-{NAMESPACE}-{name}"),
        ..OwnerReference::default()
    }
}

fn member_labels(cluster: &str, is_control_plane: bool) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([(CLUSTER_NAME_LABEL.to_string(), cluster.to_string())]);
    if is_control_plane {
        labels.insert(CONTROL_PLANE_LABEL.to_string(), String::new());
    }
    labels
}

fn host(name: &str, role: &str) -> HostSpec {
    HostSpec {
        name: name.to_string(),
        address: address(name),
        internal_address: address(name),
        roles: vec![role.to_string()],
        arch: "amd64".to_string(),
        auth: None,
    }
}

/// Cluster with three control plane and two worker hosts in its inventory.
pub fn cluster(name: &str) -> Cluster {
    let mut cluster = Cluster::new(
        name,
        ClusterSpec {
            distribution: "kubernetes".to_string(),
            control_plane_endpoint: ApiEndpoint {
                host: format!("lb.{name}.local"),
                port: 6443,
            },
            control_plane_load_balancer: None,
            paused: false,
            control_plane_ref: Some(control_plane_group_name(name)),
            hosts: vec![
                host("cp-0", ROLE_CONTROL_PLANE),
                host("cp-1", ROLE_CONTROL_PLANE),
                host("cp-2", ROLE_CONTROL_PLANE),
                host("worker-0", ROLE_WORKER),
                host("worker-1", ROLE_WORKER),
            ],
            auth: AuthSpec {
                user: Some("root".to_string()),
                port: Some(22),
                private_key_secret: Some(format!("{name}-ssh")),
            },
            container_manager: ContainerManagerSpec::default(),
            repository: None,
            binary_base_url: "https://dl.k8s.io/release".to_string(),
        },
    );
    cluster.metadata.namespace = Some(NAMESPACE.to_string());
    cluster.metadata.uid = Some(format!("uid-{NAMESPACE}-{name}"));
    cluster
}

/// Instance owned by the machine of the same name.
pub fn instance(name: &str, is_control_plane: bool, cluster: &str) -> Instance {
    let role = if is_control_plane {
        ROLE_CONTROL_PLANE
    } else {
        ROLE_WORKER
    };
    let mut instance = Instance::new(
        name,
        InstanceSpec {
            name: name.to_string(),
            address: address(name),
            internal_address: address(name),
            port: 22,
            user: "root".to_string(),
            auth: InstanceAuth {
                private_key_secret: Some(format!("{cluster}-ssh")),
            },
            arch: "amd64".to_string(),
            roles: vec![role.to_string()],
        },
    );
    instance.metadata.namespace = Some(NAMESPACE.to_string());
    instance.metadata.labels = Some(member_labels(cluster, is_control_plane));
    instance.metadata.owner_references = Some(vec![owner("Machine", name)]);
    instance
}

/// Machine owned by the cluster's control plane group or worker set.
pub fn machine(name: &str, is_control_plane: bool, cluster: &str, version: &str) -> Machine {
    let mut machine = Machine::new(
        name,
        MachineSpec {
            cluster_name: cluster.to_string(),
            version: Some(version.to_string()),
            bootstrap: Bootstrap {
                data_secret_name: Some(format!("{name}-bootstrap")),
            },
            node_drain_timeout_seconds: None,
            provider_id: Some(provider_id(cluster, name)),
            instance_id: Some(name.to_string()),
        },
    );
    let group = if is_control_plane {
        owner("ControlPlaneGroup", &control_plane_group_name(cluster))
    } else {
        owner("MachineSet", &machine_set_name(cluster))
    };
    machine.metadata.namespace = Some(NAMESPACE.to_string());
    machine.metadata.labels = Some(member_labels(cluster, is_control_plane));
    machine.metadata.owner_references = Some(vec![group]);
    machine
}

/// Seed a machine and its instance into the demo cluster.
pub fn seed_member(store: &MemoryStore, name: &str, is_control_plane: bool, version: &str) {
    store.seed(&machine(name, is_control_plane, DEMO, version));
    store.seed(&instance(name, is_control_plane, DEMO));
}

/// A provisioned member: running instance with a registered node.
fn seed_running_member(store: &MemoryStore, name: &str, is_control_plane: bool, version: &str) {
    let mut machine = machine(name, is_control_plane, DEMO, version);
    machine.status = Some(MachineStatus {
        ready: true,
        node_ref: Some(NodeRef {
            name: name.to_string(),
            uid: Some(format!("node-uid-{name}")),
        }),
        ..MachineStatus::default()
    });
    store.seed(&machine);

    let mut instance = instance(name, is_control_plane, DEMO);
    instance.metadata.finalizers = Some(vec![INSTANCE_FINALIZER.to_string()]);
    let mut conditions = Vec::new();
    for condition in [
        types::INSTANCE_BOOTSTRAPPED,
        types::INSTANCE_REPOSITORY_READY,
        types::INSTANCE_BINARIES_READY,
        types::INSTANCE_CRI_READY,
        types::INSTANCE_PROVISIONED,
        types::NODE_HEALTHY,
    ] {
        status::mark_true(&mut conditions, condition);
    }
    instance.status = Some(InstanceStatus {
        state: Some(InstanceState::Running),
        node_ref: Some(NodeRef {
            name: name.to_string(),
            uid: Some(format!("node-uid-{name}")),
        }),
        node_info: Some(NodeInfo {
            kubelet_version: version.to_string(),
            ..NodeInfo::default()
        }),
        conditions,
        ..InstanceStatus::default()
    });
    store.seed(&instance);
}

pub const DEMO_CONTROL_PLANES: [&str; 3] = ["cp-0", "cp-1", "cp-2"];
pub const DEMO_WORKERS: [&str; 2] = ["worker-0", "worker-1"];

/// The demo cluster: three control planes and two workers running
/// `version`, with their groups, plus a fleet whose hosts match.
pub fn demo(store: &MemoryStore, version: &str) -> (Cluster, FakeFleet) {
    let cluster = cluster(DEMO);
    store.seed(&cluster);

    let mut cpg = ControlPlaneGroup::new(
        &control_plane_group_name(DEMO),
        ControlPlaneGroupSpec {
            cluster_name: DEMO.to_string(),
            replicas: 3,
            version: version.to_string(),
        },
    );
    cpg.metadata.namespace = Some(NAMESPACE.to_string());
    store.seed(&cpg);

    let mut md = MachineDeployment::new(
        &machine_deployment_name(DEMO),
        MachineDeploymentSpec {
            cluster_name: DEMO.to_string(),
            replicas: 2,
            version: Some(version.to_string()),
        },
    );
    md.metadata.namespace = Some(NAMESPACE.to_string());
    md.metadata.labels = Some(member_labels(DEMO, false));
    store.seed(&md);

    let mut ms = MachineSet::new(
        &machine_set_name(DEMO),
        MachineSetSpec {
            cluster_name: DEMO.to_string(),
            replicas: 2,
            version: Some(version.to_string()),
        },
    );
    ms.metadata.namespace = Some(NAMESPACE.to_string());
    ms.metadata.labels = Some(member_labels(DEMO, false));
    ms.metadata.owner_references = Some(vec![owner(
        "MachineDeployment",
        &machine_deployment_name(DEMO),
    )]);
    store.seed(&ms);

    let fleet = FakeFleet::default();
    for name in DEMO_CONTROL_PLANES {
        seed_running_member(store, name, true, version);
        fleet.add_host(name, version, true);
    }
    for name in DEMO_WORKERS {
        seed_running_member(store, name, false, version);
        fleet.add_host(name, version, true);
    }
    (cluster, fleet)
}

/// Context over `store` wired to `fleet` and `events`.
pub fn context(
    store: MemoryStore,
    fleet: &FakeFleet,
    events: Arc<RecordedEvents>,
) -> Arc<Context<MemoryStore>> {
    let mut registry = Registry::default();
    Arc::new(Context {
        store,
        connector: Arc::new(fleet.clone()),
        nodes: Arc::new(fleet.clone()),
        events,
        metrics: Arc::new(Metrics::new(&mut registry)),
        config: OperatorConfig::new_for_test(),
    })
}

/// Simulated state of one host and its workload node.
#[derive(Debug, Clone, Default)]
pub struct FakeHost {
    pub commands: Vec<String>,
    /// Version found in `/tmp/sko/<version>`.
    pub staged: Option<String>,
    /// Version of the binaries in `/usr/local/bin`.
    pub installed: String,
    /// Version the running kubelet reports.
    pub kubelet: String,
    pub bootstrapped: bool,
    pub registered: bool,
    pub unschedulable: bool,
    /// Drain passes that report pods left before the node is empty.
    pub pending_drains: usize,
    /// Commands containing any of these fail.
    pub fail_on: Vec<String>,
}

/// Hosts keyed by instance name, shared by the runner and node fakes.
#[derive(Clone, Default)]
pub struct FakeFleet {
    hosts: Arc<Mutex<BTreeMap<String, FakeHost>>>,
}

impl FakeFleet {
    pub fn add_host(&self, name: &str, version: &str, registered: bool) {
        self.hosts.lock().unwrap().insert(
            name.to_string(),
            FakeHost {
                installed: version.to_string(),
                kubelet: version.to_string(),
                bootstrapped: registered,
                registered,
                ..FakeHost::default()
            },
        );
    }

    pub fn host(&self, name: &str) -> FakeHost {
        self.hosts.lock().unwrap().get(name).cloned().unwrap_or_default()
    }

    pub fn update(&self, name: &str, f: impl FnOnce(&mut FakeHost)) {
        if let Some(host) = self.hosts.lock().unwrap().get_mut(name) {
            f(host);
        }
    }

    pub fn kubelet(&self, name: &str) -> String {
        self.host(name).kubelet
    }

    /// Commands run on `name` that contain `needle`.
    pub fn ran(&self, name: &str, needle: &str) -> usize {
        self.host(name)
            .commands
            .iter()
            .filter(|c| c.contains(needle))
            .count()
    }

    fn node(name: &str, host: &FakeHost) -> Node {
        let condition = |type_: &str, status: &str| NodeCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            ..NodeCondition::default()
        };
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                uid: Some(format!("node-uid-{name}")),
                ..ObjectMeta::default()
            },
            spec: Some(NodeSpec {
                provider_id: Some(provider_id(DEMO, name)),
                unschedulable: Some(host.unschedulable),
                ..NodeSpec::default()
            }),
            status: Some(NodeStatus {
                node_info: Some(NodeSystemInfo {
                    kubelet_version: host.kubelet.clone(),
                    kernel_version: "6.1.0".to_string(),
                    os_image: "Ubuntu 22.04".to_string(),
                    container_runtime_version: "containerd://1.7.13".to_string(),
                    architecture: "amd64".to_string(),
                    ..NodeSystemInfo::default()
                }),
                conditions: Some(vec![
                    condition("Ready", "True"),
                    condition("MemoryPressure", "False"),
                    condition("DiskPressure", "False"),
                    condition("PIDPressure", "False"),
                ]),
                ..NodeStatus::default()
            }),
        }
    }
}

struct FakeRunner {
    fleet: FakeFleet,
    name: String,
}

impl FakeRunner {
    fn exec(host: &mut FakeHost, command: &str) -> String {
        if let Some(rest) = command.strip_prefix("mkdir -p /tmp/sko/") {
            host.staged = rest.split_whitespace().next().map(str::to_string);
        }
        if command.starts_with("install -m 755")
            && let Some(staged) = host.staged.clone()
        {
            host.installed = staged;
        }
        if command.contains("systemctl restart kubelet") {
            host.kubelet = host.installed.clone();
        }
        if command.starts_with("if [ -f /run/cluster-api/bootstrap-success.complete ]") {
            return if host.bootstrapped {
                "exists".to_string()
            } else {
                String::new()
            };
        }
        if command.contains("echo success > /run/cluster-api/bootstrap-success.complete") {
            host.bootstrapped = true;
            host.registered = true;
        }
        if command.contains("kubeadm reset -f") {
            host.registered = false;
        }
        String::new()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    fn host(&self) -> String {
        self.name.clone()
    }

    async fn run_privileged(&self, command: &str) -> Result<String, ExecError> {
        let mut hosts = self.fleet.hosts.lock().unwrap();
        let Some(host) = hosts.get_mut(&self.name) else {
            return Err(ExecError::Spawn {
                host: self.name.clone(),
                message: "no route to host".to_string(),
            });
        };
        host.commands.push(command.to_string());
        if host.fail_on.iter().any(|f| command.contains(f.as_str())) {
            return Err(ExecError::NonZeroExit {
                host: self.name.clone(),
                code: 1,
                output: "simulated failure".to_string(),
            });
        }
        Ok(Self::exec(host, command))
    }
}

#[async_trait]
impl Connector for FakeFleet {
    async fn connect(&self, instance: &Instance) -> Result<Arc<dyn CommandRunner>, ExecError> {
        let name = instance.metadata.name.clone().unwrap_or_default();
        Ok(Arc::new(FakeRunner {
            fleet: self.clone(),
            name,
        }))
    }
}

#[async_trait]
impl NodeAccess for FakeFleet {
    async fn node_by_provider_id(
        &self,
        _namespace: &str,
        cluster: &str,
        provider_id: &str,
    ) -> Result<Option<Node>, NodeError> {
        let hosts = self.hosts.lock().unwrap();
        Ok(hosts
            .iter()
            .find(|(name, host)| {
                host.registered && crate::crd::machine::provider_id(cluster, name) == provider_id
            })
            .map(|(name, host)| Self::node(name, host)))
    }

    async fn cordon(
        &self,
        _namespace: &str,
        _cluster: &str,
        node: &str,
        unschedulable: bool,
    ) -> Result<(), NodeError> {
        self.update(node, |h| h.unschedulable = unschedulable);
        Ok(())
    }

    async fn drain(
        &self,
        _namespace: &str,
        _cluster: &str,
        node: &str,
    ) -> Result<DrainOutcome, NodeError> {
        let mut hosts = self.hosts.lock().unwrap();
        let host = hosts
            .get_mut(node)
            .ok_or_else(|| NodeError::Client(format!("node {node} not found")))?;
        if host.pending_drains > 0 {
            host.pending_drains -= 1;
            return Ok(DrainOutcome::Pending(1));
        }
        Ok(DrainOutcome::Done)
    }
}

/// An event captured by [`RecordedEvents`].
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub object: String,
    pub warning: bool,
    pub reason: String,
    pub message: String,
}

#[derive(Default)]
pub struct RecordedEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordedEvents {
    pub fn all(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, reason: &str) -> usize {
        self.all().iter().filter(|e| e.reason == reason).count()
    }

    fn push(&self, obj_ref: &ObjectReference, warning: bool, reason: &str, message: &str) {
        self.events.lock().unwrap().push(RecordedEvent {
            object: obj_ref.name.clone().unwrap_or_default(),
            warning,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

#[async_trait]
impl EventPublisher for RecordedEvents {
    async fn publish(&self, obj_ref: &ObjectReference, reason: &str, message: &str) {
        self.push(obj_ref, false, reason, message);
    }

    async fn publish_warning(&self, obj_ref: &ObjectReference, reason: &str, message: &str) {
        self.push(obj_ref, true, reason, message);
    }
}
