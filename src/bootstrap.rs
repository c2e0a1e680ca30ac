//! Control-plane bootstrap sequencer
//!
//! The per-machine state machine that simulates provisioning of a node, an
//! etcd member, an API server instance, a scheduler, a controller manager
//! and supporting cluster objects, and that tears them down again on
//! deletion.
//!
//! Phases run strictly in declared order. Each phase is idempotent and
//! independently requeueable: it no-ops until the condition it is gated on
//! turns `True`, models a startup delay from that condition's transition
//! time, and reports outstanding work as a requeue delay rather than
//! blocking. One invocation runs to completion without sleeping; all retry
//! is driven by the caller re-invoking on the returned delay or on a watch
//! of the upstream objects.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, Node, NodeCondition, NodeSpec, NodeStatus, Pod, PodCondition, PodSpec,
    PodStatus, PodTemplateSpec,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::api::{Cluster, Machine, CONTROL_PLANE_INITIALIZED_CONDITION};
use crate::conditions::{self, ConditionSeverity, ConditionsTracker};
use crate::error::Error;
use crate::etcd::{self, EtcdMember};
use crate::secrets::{CaPurpose, CaSecrets};
use crate::server::ControlPlaneListeners;
use crate::store::{ResourceGroup, ResourceGroupRegistry, StoreError};

/// Finalizer held by this simulator on the machine's infrastructure object
/// until teardown has nothing left to do
pub const VM_FINALIZER: &str = "vcsim.infrastructure.cluster.x-k8s.io";

/// Condition documenting VM provisioning, including bootstrap data being
/// available
pub const VM_PROVISIONED_CONDITION: &str = "VMProvisioned";

/// Condition documenting provisioning of the Kubernetes node
pub const NODE_PROVISIONED_CONDITION: &str = "NodeProvisioned";

/// Condition documenting provisioning of the etcd member
pub const ETCD_PROVISIONED_CONDITION: &str = "EtcdProvisioned";

/// Condition documenting provisioning of the API server instance
pub const API_SERVER_PROVISIONED_CONDITION: &str = "APIServerProvisioned";

/// Reason: waiting for the VM infrastructure to be ready
pub const WAITING_FOR_VM_INFRASTRUCTURE_REASON: &str = "WaitingForVMInfrastructure";

/// Reason: waiting for the control plane to be initialized before a worker
/// can get bootstrap data
pub const WAITING_CONTROL_PLANE_INITIALIZED_REASON: &str = "WaitingControlPlaneInitialized";

/// Reason: waiting for the bootstrap provider to attach bootstrap data
pub const WAITING_FOR_BOOTSTRAP_DATA_REASON: &str = "WaitingForBootstrapData";

/// Reason: waiting out the simulated startup delay of the component
pub const WAITING_FOR_STARTUP_TIMEOUT_REASON: &str = "WaitingForStartupTimeout";

const KUBE_SYSTEM: &str = "kube-system";
const CONTROL_PLANE_NODE_LABEL: &str = "node-role.kubernetes.io/control-plane";
const ETCD_POD_SELECTOR: &[(&str, &str)] = &[("component", "etcd"), ("tier", "control-plane")];

// Requeue interval while waiting for bootstrap data; there is no watch on
// machines, so the wait is polled.
const BOOTSTRAP_DATA_REQUEUE: Duration = Duration::from_secs(5);

/// Aggregated result of one sequencer invocation: either done, or a delay
/// after which the caller should re-invoke
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outcome {
    requeue_after: Option<Duration>,
}

impl Outcome {
    /// No outstanding work and no requeue scheduled
    pub const fn done() -> Self {
        Self {
            requeue_after: None,
        }
    }

    /// Re-invoke after the given delay
    pub const fn requeue(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
        }
    }

    /// The requeue delay, if one was requested
    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }

    /// Whether this outcome requests nothing from the caller
    pub fn is_zero(&self) -> bool {
        self.requeue_after.is_none()
    }

    /// Combine two outcomes, keeping the lowest non-zero requeue delay so a
    /// waiting phase deeper in the chain does not starve an earlier one
    pub fn lowest_non_zero(self, other: Self) -> Self {
        match (self.requeue_after, other.requeue_after) {
            (Some(a), Some(b)) => Outcome::requeue(a.min(b)),
            (Some(a), None) => Outcome::requeue(a),
            (None, b) => Outcome { requeue_after: b },
        }
    }
}

/// Simulated startup delays, applied from the transition time of the
/// predecessor condition
///
/// Each evaluation applies a fresh bounded jitter fraction on top of the
/// base duration, so the remaining-time estimate may differ across calls;
/// the delay model is advisory, not a scheduling guarantee.
#[derive(Debug, Clone)]
pub struct StartupTimings {
    /// Base startup duration of the node
    pub node: Duration,

    /// Base startup duration of the etcd member, counted from node
    /// provisioning
    pub etcd: Duration,

    /// Base startup duration of the API server, counted from node
    /// provisioning
    pub api_server: Duration,

    /// Upper bound of the random jitter fraction added to each base
    /// duration
    pub jitter: f64,
}

impl Default for StartupTimings {
    fn default() -> Self {
        Self {
            node: Duration::from_secs(10),
            etcd: Duration::from_secs(10),
            api_server: Duration::from_secs(10),
            jitter: 0.3,
        }
    }
}

impl StartupTimings {
    /// Zero delays everywhere; components come up on the first pass
    pub fn immediate() -> Self {
        Self {
            node: Duration::ZERO,
            etcd: Duration::ZERO,
            api_server: Duration::ZERO,
            jitter: 0.0,
        }
    }
}

/// View of the machine's backing VM, supplied by the caller
///
/// The sequencer does not advance past its preconditions until the VM
/// reports ready; the provider ID seeds the simulated node.
pub trait VmInfra: Send + Sync {
    /// Whether the VM infrastructure is ready
    fn is_ready(&self) -> bool;

    /// Provider ID assigned by the infrastructure
    fn provider_id(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhaseId {
    Node,
    Etcd,
    ApiServer,
    Scheduler,
    ControllerManager,
    KubeadmObjects,
    KubeProxy,
    CoreDns,
}

/// One entry of the ordered phase table: the sequencer loop evaluates
/// applicability and gating from the descriptor, the phase body only does
/// timing and side effects.
struct PhaseDescriptor {
    name: &'static str,
    id: PhaseId,
    control_plane_only: bool,
    gated_on: Option<&'static str>,
}

const BOOTSTRAP_PHASES: &[PhaseDescriptor] = &[
    PhaseDescriptor {
        name: "node",
        id: PhaseId::Node,
        control_plane_only: false,
        gated_on: None,
    },
    PhaseDescriptor {
        name: "etcd",
        id: PhaseId::Etcd,
        control_plane_only: true,
        gated_on: Some(NODE_PROVISIONED_CONDITION),
    },
    PhaseDescriptor {
        name: "api-server",
        id: PhaseId::ApiServer,
        control_plane_only: true,
        gated_on: Some(NODE_PROVISIONED_CONDITION),
    },
    PhaseDescriptor {
        name: "scheduler",
        id: PhaseId::Scheduler,
        control_plane_only: true,
        gated_on: Some(API_SERVER_PROVISIONED_CONDITION),
    },
    PhaseDescriptor {
        name: "controller-manager",
        id: PhaseId::ControllerManager,
        control_plane_only: true,
        gated_on: Some(API_SERVER_PROVISIONED_CONDITION),
    },
    PhaseDescriptor {
        name: "kubeadm-objects",
        id: PhaseId::KubeadmObjects,
        control_plane_only: true,
        gated_on: None,
    },
    PhaseDescriptor {
        name: "kube-proxy",
        id: PhaseId::KubeProxy,
        control_plane_only: true,
        gated_on: None,
    },
    PhaseDescriptor {
        name: "coredns",
        id: PhaseId::CoreDns,
        control_plane_only: true,
        gated_on: None,
    },
];

// Teardown runs node first regardless of creation order. Kubeadm,
// kube-proxy and CoreDNS objects belong to the cluster, not to a machine,
// and are not deleted here.
const DELETE_PHASES: &[PhaseDescriptor] = &[
    PhaseDescriptor {
        name: "node",
        id: PhaseId::Node,
        control_plane_only: false,
        gated_on: None,
    },
    PhaseDescriptor {
        name: "etcd",
        id: PhaseId::Etcd,
        control_plane_only: true,
        gated_on: None,
    },
    PhaseDescriptor {
        name: "api-server",
        id: PhaseId::ApiServer,
        control_plane_only: true,
        gated_on: None,
    },
    PhaseDescriptor {
        name: "scheduler",
        id: PhaseId::Scheduler,
        control_plane_only: true,
        gated_on: None,
    },
    PhaseDescriptor {
        name: "controller-manager",
        id: PhaseId::ControllerManager,
        control_plane_only: true,
        gated_on: None,
    },
];

/// The per-machine bootstrap and deletion sequencer
///
/// One instance serves every machine; per-cluster isolation comes from the
/// resource-group registry, and concurrent invocations for sibling
/// machines coordinate through the store's revision-conditioned writes.
pub struct BootstrapSequencer {
    groups: Arc<ResourceGroupRegistry>,
    listeners: Arc<dyn ControlPlaneListeners>,
    secrets: Arc<dyn CaSecrets>,
    timings: StartupTimings,
    rng: Mutex<SmallRng>,
}

impl BootstrapSequencer {
    /// Create a sequencer with default timings and an entropy-seeded RNG
    pub fn new(
        groups: Arc<ResourceGroupRegistry>,
        listeners: Arc<dyn ControlPlaneListeners>,
        secrets: Arc<dyn CaSecrets>,
    ) -> Self {
        Self {
            groups,
            listeners,
            secrets,
            timings: StartupTimings::default(),
            rng: Mutex::new(SmallRng::from_entropy()),
        }
    }

    /// Override the simulated startup delays
    pub fn with_timings(mut self, timings: StartupTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Seed the RNG used for jitter and etcd ID minting, for deterministic
    /// replay
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(SmallRng::seed_from_u64(seed));
        self
    }

    fn rng(&self) -> MutexGuard<'_, SmallRng> {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn group(&self, cluster: &Cluster) -> Arc<ResourceGroup> {
        self.groups.get_or_create(&cluster.resource_group())
    }

    /// Run the bootstrap phases for one machine
    ///
    /// Stops at the first phase reporting an error; otherwise returns the
    /// lowest non-zero requeue delay among all phases that ran. A zero
    /// outcome with the VM not yet ready means the caller is expected to be
    /// re-triggered by a watch on the infrastructure object.
    pub async fn advance(
        &self,
        cluster: &Cluster,
        machine: &Machine,
        vm: &dyn VmInfra,
        tracker: &mut ConditionsTracker,
    ) -> Result<Outcome, Error> {
        if !conditions::has(tracker, VM_PROVISIONED_CONDITION) {
            conditions::mark_false(
                tracker,
                VM_PROVISIONED_CONDITION,
                WAITING_FOR_VM_INFRASTRUCTURE_REASON,
                ConditionSeverity::Info,
                "",
            );
        }

        // Bootstrap data is not used, but waiting for it mirrors a real
        // machine provisioning workflow.
        if machine.bootstrap_data_secret.is_none() {
            if !machine.is_control_plane()
                && !conditions::is_true(cluster, CONTROL_PLANE_INITIALIZED_CONDITION)
            {
                conditions::mark_false(
                    tracker,
                    VM_PROVISIONED_CONDITION,
                    WAITING_CONTROL_PLANE_INITIALIZED_REASON,
                    ConditionSeverity::Info,
                    "",
                );
                info!(machine = %machine.name, "waiting for the control plane to be initialized");
                return Ok(Outcome::requeue(BOOTSTRAP_DATA_REQUEUE));
            }

            conditions::mark_false(
                tracker,
                VM_PROVISIONED_CONDITION,
                WAITING_FOR_BOOTSTRAP_DATA_REASON,
                ConditionSeverity::Info,
                "",
            );
            info!(machine = %machine.name, "waiting for the bootstrap provider to set bootstrap data");
            return Ok(Outcome::requeue(BOOTSTRAP_DATA_REQUEUE));
        }

        if !vm.is_ready() {
            debug!(machine = %machine.name, "waiting for machine infrastructure to become ready");
            return Ok(Outcome::done());
        }
        if !conditions::is_true(tracker, VM_PROVISIONED_CONDITION) {
            conditions::mark_true(tracker, VM_PROVISIONED_CONDITION);
        }

        let mut res = Outcome::done();
        let mut errs: Vec<Error> = Vec::new();
        for phase in BOOTSTRAP_PHASES {
            if phase.control_plane_only && !machine.is_control_plane() {
                continue;
            }
            if let Some(gate) = phase.gated_on {
                if !conditions::is_true(tracker, gate) {
                    continue;
                }
            }
            match self
                .run_bootstrap_phase(phase.id, cluster, machine, vm, tracker)
                .await
            {
                Ok(outcome) => res = res.lowest_non_zero(outcome),
                Err(err) => {
                    debug!(machine = %machine.name, phase = phase.name, error = %err, "bootstrap phase failed");
                    errs.push(err);
                    break;
                }
            }
        }

        match Error::aggregate(errs) {
            Some(err) => Err(err),
            None => Ok(res),
        }
    }

    async fn run_bootstrap_phase(
        &self,
        id: PhaseId,
        cluster: &Cluster,
        machine: &Machine,
        vm: &dyn VmInfra,
        tracker: &mut ConditionsTracker,
    ) -> Result<Outcome, Error> {
        match id {
            PhaseId::Node => self.bootstrap_node(cluster, machine, vm, tracker).await,
            PhaseId::Etcd => self.bootstrap_etcd(cluster, tracker).await,
            PhaseId::ApiServer => self.bootstrap_api_server(cluster, tracker).await,
            PhaseId::Scheduler => self.bootstrap_component_pod(cluster, tracker, "kube-scheduler"),
            PhaseId::ControllerManager => {
                self.bootstrap_component_pod(cluster, tracker, "kube-controller-manager")
            }
            PhaseId::KubeadmObjects => self.bootstrap_kubeadm_objects(cluster),
            PhaseId::KubeProxy => self.bootstrap_kube_proxy(cluster, machine),
            PhaseId::CoreDns => self.bootstrap_coredns(cluster),
        }
    }

    /// Instant the component is allowed to come up: the predecessor
    /// condition's transition time plus the jittered base duration
    fn provisioning_target(
        &self,
        tracker: &ConditionsTracker,
        start_condition: &str,
        base: Duration,
    ) -> DateTime<Utc> {
        let jitter = self.rng().gen::<f64>() * self.timings.jitter;
        let duration = base + base.mul_f64(jitter);
        let start = conditions::get(tracker, start_condition)
            .map(|c| c.last_transition_time)
            .unwrap_or_else(Utc::now);
        start + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
    }

    /// Check the startup delay of a phase; returns the waiting outcome when
    /// the component is still starting up
    fn wait_for_startup(
        &self,
        tracker: &mut ConditionsTracker,
        phase_condition: &str,
        start_condition: &str,
        base: Duration,
        component: &str,
    ) -> Option<Outcome> {
        let target = self.provisioning_target(tracker, start_condition, base);
        let now = Utc::now();
        if now < target {
            conditions::mark_false(
                tracker,
                phase_condition,
                WAITING_FOR_STARTUP_TIMEOUT_REASON,
                ConditionSeverity::Info,
                "",
            );
            let remaining = (target - now).to_std().unwrap_or(Duration::ZERO);
            debug!(
                component,
                machine = %tracker.name,
                remaining_secs = remaining.as_secs_f64(),
                "waiting for startup"
            );
            return Some(Outcome::requeue(remaining));
        }
        None
    }

    async fn bootstrap_node(
        &self,
        cluster: &Cluster,
        machine: &Machine,
        vm: &dyn VmInfra,
        tracker: &mut ConditionsTracker,
    ) -> Result<Outcome, Error> {
        let node_name = tracker.name.clone();

        if let Some(wait) = self.wait_for_startup(
            tracker,
            NODE_PROVISIONED_CONDITION,
            VM_PROVISIONED_CONDITION,
            self.timings.node,
            "node",
        ) {
            return Ok(wait);
        }

        let group = self.group(cluster);

        let mut node = Node {
            metadata: ObjectMeta {
                name: Some(node_name.clone()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: Some(vm.provider_id()),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        };
        if machine.is_control_plane() {
            node.metadata
                .labels
                .get_or_insert_with(Default::default)
                .insert(CONTROL_PLANE_NODE_LABEL.to_string(), String::new());
        }

        // For the first control plane machine the node may exist before the
        // etcd and API server pods run; CAPI cannot see it until the API
        // server starts serving, so this is harmless.
        match group.get::<Node>("", &node_name) {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {
                ignore_already_exists(group.create(&node))?;
                info!(node = %node_name, "node created");
            }
            Err(err) => return Err(err.into()),
        }

        conditions::mark_true(tracker, NODE_PROVISIONED_CONDITION);
        Ok(Outcome::done())
    }

    async fn bootstrap_etcd(
        &self,
        cluster: &Cluster,
        tracker: &mut ConditionsTracker,
    ) -> Result<Outcome, Error> {
        let member_name = format!("etcd-{}", tracker.name);

        if let Some(wait) = self.wait_for_startup(
            tracker,
            ETCD_PROVISIONED_CONDITION,
            NODE_PROVISIONED_CONDITION,
            self.timings.etcd,
            "etcd",
        ) {
            return Ok(wait);
        }

        let resource_group = cluster.resource_group();
        let group = self.group(cluster);

        match group.get::<Pod>(KUBE_SYSTEM, &member_name) {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {
                // Derive membership from a scan of the current members and
                // create conditionally on the revision of that scan, so two
                // sibling machines racing here cannot mint duplicate IDs or
                // a second leader.
                let (pods, revision) =
                    group.list_with_revision::<Pod>(KUBE_SYSTEM, ETCD_POD_SELECTOR)?;
                let info = etcd::cluster_info(&pods)?;

                let member = {
                    let mut rng = self.rng();
                    match info {
                        Some(info) => EtcdMember::new(
                            info.cluster_id.clone(),
                            etcd::mint_member_id(&mut *rng, &info.members),
                        ),
                        None => {
                            // First member of a new cluster: mint the
                            // cluster ID and claim leadership.
                            let cluster_id = etcd::mint_cluster_id(&mut *rng);
                            let member_id = etcd::mint_member_id(&mut *rng, &BTreeSet::new());
                            EtcdMember::new(cluster_id, member_id).with_leadership(Utc::now())
                        }
                    }
                };

                let mut pod = control_plane_pod(&member_name, "etcd", &tracker.name);
                member.apply_to(&mut pod.metadata);
                ignore_already_exists(group.create_if_revision(&pod, revision))?;
                info!(
                    member = %member_name,
                    member_id = %member.member_id,
                    leader = member.leader_from.is_some(),
                    "etcd member created"
                );
            }
            Err(err) => return Err(err.into()),
        }

        let listener = self.listeners.listener_by_resource_group(&resource_group)?;
        if !self.listeners.has_etcd_member(&listener, &member_name) {
            let ca = self
                .secrets
                .certificate_authority(cluster, CaPurpose::Etcd)
                .await?;
            self.listeners.add_etcd_member(&listener, &member_name, &ca)?;
            info!(member = %member_name, listener = %listener, "etcd member started");
        }

        conditions::mark_true(tracker, ETCD_PROVISIONED_CONDITION);
        Ok(Outcome::done())
    }

    async fn bootstrap_api_server(
        &self,
        cluster: &Cluster,
        tracker: &mut ConditionsTracker,
    ) -> Result<Outcome, Error> {
        let api_server = format!("kube-apiserver-{}", tracker.name);

        if let Some(wait) = self.wait_for_startup(
            tracker,
            API_SERVER_PROVISIONED_CONDITION,
            NODE_PROVISIONED_CONDITION,
            self.timings.api_server,
            "api-server",
        ) {
            return Ok(wait);
        }

        let resource_group = cluster.resource_group();
        let group = self.group(cluster);

        match group.get::<Pod>(KUBE_SYSTEM, &api_server) {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {
                let pod = control_plane_pod(&api_server, "kube-apiserver", &tracker.name);
                ignore_already_exists(group.create(&pod))?;
            }
            Err(err) => return Err(err.into()),
        }

        // When the first API server is added the workload cluster listener
        // starts serving.
        let listener = self.listeners.listener_by_resource_group(&resource_group)?;
        if !self.listeners.has_api_server(&listener, &api_server) {
            let ca = self
                .secrets
                .certificate_authority(cluster, CaPurpose::Cluster)
                .await?;
            self.listeners.add_api_server(&listener, &api_server, &ca)?;
            info!(api_server = %api_server, listener = %listener, "API server started");
        }

        conditions::mark_true(tracker, API_SERVER_PROVISIONED_CONDITION);
        Ok(Outcome::done())
    }

    /// Scheduler and controller manager are created to keep control plane
    /// tooling happy but model no behavior of their own: they come up as
    /// soon as the API server is provisioned and are immediately ready.
    fn bootstrap_component_pod(
        &self,
        cluster: &Cluster,
        tracker: &ConditionsTracker,
        component: &str,
    ) -> Result<Outcome, Error> {
        let group = self.group(cluster);
        let pod = control_plane_pod(
            &format!("{}-{}", component, tracker.name),
            component,
            &tracker.name,
        );
        ignore_already_exists(group.create(&pod))?;
        Ok(Outcome::done())
    }

    /// ClusterRole, ClusterRoleBinding and kubeadm-config that kubeadm
    /// would create on a real cluster
    fn bootstrap_kubeadm_objects(&self, cluster: &Cluster) -> Result<Outcome, Error> {
        let group = self.group(cluster);

        let role = ClusterRole {
            metadata: ObjectMeta {
                name: Some("kubeadm:get-nodes".to_string()),
                ..Default::default()
            },
            rules: Some(vec![PolicyRule {
                verbs: vec!["get".to_string()],
                api_groups: Some(vec![String::new()]),
                resources: Some(vec!["nodes".to_string()]),
                ..Default::default()
            }]),
            ..Default::default()
        };
        ignore_already_exists(group.create(&role))?;

        let role_binding = ClusterRoleBinding {
            metadata: ObjectMeta {
                name: Some("kubeadm:get-nodes".to_string()),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "ClusterRole".to_string(),
                name: "kubeadm:get-nodes".to_string(),
            },
            subjects: Some(vec![Subject {
                kind: "Group".to_string(),
                name: "system:bootstrappers:kubeadm:default-node-token".to_string(),
                ..Default::default()
            }]),
        };
        ignore_already_exists(group.create(&role_binding))?;

        let config = ConfigMap {
            metadata: ObjectMeta {
                name: Some("kubeadm-config".to_string()),
                namespace: Some(KUBE_SYSTEM.to_string()),
                ..Default::default()
            },
            data: Some(
                [("ClusterConfiguration".to_string(), String::new())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        };
        ignore_already_exists(group.create(&config))?;

        Ok(Outcome::done())
    }

    fn bootstrap_kube_proxy(&self, cluster: &Cluster, machine: &Machine) -> Result<Outcome, Error> {
        let group = self.group(cluster);

        let daemon_set = DaemonSet {
            metadata: ObjectMeta {
                name: Some("kube-proxy".to_string()),
                namespace: Some(KUBE_SYSTEM.to_string()),
                labels: Some(
                    [("component".to_string(), "kube-proxy".to_string())]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(DaemonSetSpec {
                selector: LabelSelector {
                    match_labels: Some(
                        [("k8s-app".to_string(), "kube-proxy".to_string())]
                            .into_iter()
                            .collect(),
                    ),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "kube-proxy".to_string(),
                            image: Some(format!(
                                "registry.k8s.io/kube-proxy:{}",
                                machine.version
                            )),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        };

        match group.get::<DaemonSet>(KUBE_SYSTEM, "kube-proxy") {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {
                ignore_already_exists(group.create(&daemon_set))?;
            }
            Err(err) => return Err(err.into()),
        }
        Ok(Outcome::done())
    }

    fn bootstrap_coredns(&self, cluster: &Cluster) -> Result<Outcome, Error> {
        let group = self.group(cluster);

        let config = ConfigMap {
            metadata: ObjectMeta {
                name: Some("coredns".to_string()),
                namespace: Some(KUBE_SYSTEM.to_string()),
                ..Default::default()
            },
            data: Some(
                [("Corefile".to_string(), ".:53 {}\n".to_string())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        };
        match group.get::<ConfigMap>(KUBE_SYSTEM, "coredns") {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {
                ignore_already_exists(group.create(&config))?;
            }
            Err(err) => return Err(err.into()),
        }

        let deployment = Deployment {
            metadata: ObjectMeta {
                name: Some("coredns".to_string()),
                namespace: Some(KUBE_SYSTEM.to_string()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "coredns".to_string(),
                            image: Some("registry.k8s.io/coredns/coredns:v1.11.1".to_string()),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        };
        match group.get::<Deployment>(KUBE_SYSTEM, "coredns") {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {
                ignore_already_exists(group.create(&deployment))?;
            }
            Err(err) => return Err(err.into()),
        }
        Ok(Outcome::done())
    }

    /// Run the deletion phases for one machine
    ///
    /// Every phase deletes its backing objects if present (not-found is
    /// success) and unregisters etcd/API-server instances from the
    /// listener. The provisioning finalizer is removed only once every
    /// phase reports a zero outcome, so cleanup is retried at least once
    /// for each failure.
    pub async fn teardown(
        &self,
        cluster: &Cluster,
        machine: &Machine,
        tracker: &mut ConditionsTracker,
    ) -> Result<Outcome, Error> {
        let mut res = Outcome::done();
        let mut errs: Vec<Error> = Vec::new();
        for phase in DELETE_PHASES {
            if phase.control_plane_only && !machine.is_control_plane() {
                continue;
            }
            match self.run_delete_phase(phase.id, cluster, tracker) {
                Ok(outcome) => res = res.lowest_non_zero(outcome),
                Err(err) => {
                    debug!(machine = %machine.name, phase = phase.name, error = %err, "delete phase failed");
                    errs.push(err);
                    break;
                }
            }
        }

        if res.is_zero() && errs.is_empty() {
            tracker.remove_finalizer(VM_FINALIZER);
        }

        match Error::aggregate(errs) {
            Some(err) => Err(err),
            None => Ok(res),
        }
    }

    fn run_delete_phase(
        &self,
        id: PhaseId,
        cluster: &Cluster,
        tracker: &ConditionsTracker,
    ) -> Result<Outcome, Error> {
        match id {
            PhaseId::Node => self.delete_node(cluster, tracker),
            PhaseId::Etcd => self.delete_etcd(cluster, tracker),
            PhaseId::ApiServer => self.delete_api_server(cluster, tracker),
            PhaseId::Scheduler => self.delete_component_pod(cluster, tracker, "kube-scheduler"),
            PhaseId::ControllerManager => {
                self.delete_component_pod(cluster, tracker, "kube-controller-manager")
            }
            // Remaining bootstrap phases have no deletion counterpart.
            _ => Ok(Outcome::done()),
        }
    }

    fn delete_node(&self, cluster: &Cluster, tracker: &ConditionsTracker) -> Result<Outcome, Error> {
        let group = self.group(cluster);
        ignore_not_found(group.delete::<Node>("", &tracker.name))?;
        Ok(Outcome::done())
    }

    fn delete_etcd(&self, cluster: &Cluster, tracker: &ConditionsTracker) -> Result<Outcome, Error> {
        let member_name = format!("etcd-{}", tracker.name);
        let group = self.group(cluster);
        ignore_not_found(group.delete::<Pod>(KUBE_SYSTEM, &member_name))?;

        let listener = self
            .listeners
            .listener_by_resource_group(&cluster.resource_group())?;
        self.listeners.delete_etcd_member(&listener, &member_name)?;
        Ok(Outcome::done())
    }

    fn delete_api_server(
        &self,
        cluster: &Cluster,
        tracker: &ConditionsTracker,
    ) -> Result<Outcome, Error> {
        let api_server = format!("kube-apiserver-{}", tracker.name);
        let group = self.group(cluster);
        ignore_not_found(group.delete::<Pod>(KUBE_SYSTEM, &api_server))?;

        let listener = self
            .listeners
            .listener_by_resource_group(&cluster.resource_group())?;
        self.listeners.delete_api_server(&listener, &api_server)?;
        Ok(Outcome::done())
    }

    fn delete_component_pod(
        &self,
        cluster: &Cluster,
        tracker: &ConditionsTracker,
        component: &str,
    ) -> Result<Outcome, Error> {
        let group = self.group(cluster);
        ignore_not_found(
            group.delete::<Pod>(KUBE_SYSTEM, &format!("{}-{}", component, tracker.name)),
        )?;
        Ok(Outcome::done())
    }
}

/// A ready control-plane pod bound to the machine's node
fn control_plane_pod(name: &str, component: &str, node_name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(KUBE_SYSTEM.to_string()),
            labels: Some(
                [
                    ("component".to_string(), component.to_string()),
                    ("tier".to_string(), "control-plane".to_string()),
                ]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node_name.to_string()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

fn ignore_already_exists(res: Result<(), StoreError>) -> Result<(), StoreError> {
    match res {
        Err(err) if err.is_already_exists() => Ok(()),
        other => other,
    }
}

fn ignore_not_found(res: Result<(), StoreError>) -> Result<(), StoreError> {
    match res {
        Err(err) if err.is_not_found() => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::Conditions;
    use crate::secrets::StaticCaSecrets;
    use crate::server::WorkloadListeners;

    struct ReadyVm;

    impl VmInfra for ReadyVm {
        fn is_ready(&self) -> bool {
            true
        }

        fn provider_id(&self) -> String {
            "vcsim://vm-1".to_string()
        }
    }

    struct NotReadyVm;

    impl VmInfra for NotReadyVm {
        fn is_ready(&self) -> bool {
            false
        }

        fn provider_id(&self) -> String {
            String::new()
        }
    }

    struct Env {
        groups: Arc<ResourceGroupRegistry>,
        listeners: Arc<WorkloadListeners>,
        cluster: Cluster,
        sequencer: BootstrapSequencer,
    }

    fn env() -> Env {
        env_with_timings(StartupTimings::immediate())
    }

    fn env_with_timings(timings: StartupTimings) -> Env {
        let groups = Arc::new(ResourceGroupRegistry::default());
        let listeners = Arc::new(WorkloadListeners::default());
        let secrets = Arc::new(StaticCaSecrets::default());

        let cluster = Cluster::new("test", "default");
        listeners.register(&cluster.resource_group(), "workload-1");
        secrets.provision_cluster(&cluster).unwrap();

        let sequencer =
            BootstrapSequencer::new(groups.clone(), listeners.clone(), secrets)
                .with_timings(timings)
                .with_rng_seed(7);
        Env {
            groups,
            listeners,
            cluster,
            sequencer,
        }
    }

    fn cp_machine(name: &str) -> Machine {
        Machine::new(name, "default", "1.30.0")
            .control_plane()
            .with_bootstrap_data(format!("{}-bootstrap", name))
    }

    #[tokio::test]
    async fn worker_waits_for_control_plane_initialized() {
        let env = env();
        let machine = Machine::new("worker-0", "default", "1.30.0");
        let mut tracker = ConditionsTracker::new("worker-0", "default");

        let outcome = env
            .sequencer
            .advance(&env.cluster, &machine, &ReadyVm, &mut tracker)
            .await
            .unwrap();

        assert_eq!(outcome.requeue_after(), Some(BOOTSTRAP_DATA_REQUEUE));
        let cond = conditions::get(&tracker, VM_PROVISIONED_CONDITION).unwrap();
        assert_eq!(cond.reason, WAITING_CONTROL_PLANE_INITIALIZED_REASON);
        let group = env.groups.get_or_create(&env.cluster.resource_group());
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn machine_waits_for_bootstrap_data() {
        let env = env();
        // A control plane machine skips the initialization gate but still
        // waits for its bootstrap data.
        let machine = Machine::new("cp-0", "default", "1.30.0").control_plane();
        let mut tracker = ConditionsTracker::new("cp-0", "default");

        let outcome = env
            .sequencer
            .advance(&env.cluster, &machine, &ReadyVm, &mut tracker)
            .await
            .unwrap();

        assert_eq!(outcome.requeue_after(), Some(BOOTSTRAP_DATA_REQUEUE));
        let cond = conditions::get(&tracker, VM_PROVISIONED_CONDITION).unwrap();
        assert_eq!(cond.reason, WAITING_FOR_BOOTSTRAP_DATA_REASON);
    }

    #[tokio::test]
    async fn unready_vm_defers_to_infrastructure_watch() {
        let env = env();
        let machine = cp_machine("cp-0");
        let mut tracker = ConditionsTracker::new("cp-0", "default");

        let outcome = env
            .sequencer
            .advance(&env.cluster, &machine, &NotReadyVm, &mut tracker)
            .await
            .unwrap();

        // No requeue: progress resumes when the infrastructure object
        // changes, not on a timer.
        assert!(outcome.is_zero());
        assert!(!conditions::is_true(&tracker, VM_PROVISIONED_CONDITION));
        let group = env.groups.get_or_create(&env.cluster.resource_group());
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn control_plane_machine_bootstraps_in_one_pass() {
        let env = env();
        let machine = cp_machine("cp-0");
        let mut tracker = ConditionsTracker::new("cp-0", "default");

        let outcome = env
            .sequencer
            .advance(&env.cluster, &machine, &ReadyVm, &mut tracker)
            .await
            .unwrap();
        assert!(outcome.is_zero());

        for condition in [
            VM_PROVISIONED_CONDITION,
            NODE_PROVISIONED_CONDITION,
            ETCD_PROVISIONED_CONDITION,
            API_SERVER_PROVISIONED_CONDITION,
        ] {
            assert!(conditions::is_true(&tracker, condition), "{}", condition);
        }

        let group = env.groups.get_or_create(&env.cluster.resource_group());
        let node: Node = group.get("", "cp-0").unwrap();
        assert_eq!(
            node.spec.unwrap().provider_id.as_deref(),
            Some("vcsim://vm-1")
        );
        assert!(node
            .metadata
            .labels
            .unwrap()
            .contains_key(CONTROL_PLANE_NODE_LABEL));

        let etcd_pod: Pod = group.get(KUBE_SYSTEM, "etcd-cp-0").unwrap();
        let member = EtcdMember::from_pod(&etcd_pod).unwrap();
        assert!(member.leader_from.is_some(), "first member claims leadership");

        for pod in [
            "kube-apiserver-cp-0",
            "kube-scheduler-cp-0",
            "kube-controller-manager-cp-0",
        ] {
            group.get::<Pod>(KUBE_SYSTEM, pod).unwrap();
        }
        group.get::<ClusterRole>("", "kubeadm:get-nodes").unwrap();
        group
            .get::<ClusterRoleBinding>("", "kubeadm:get-nodes")
            .unwrap();
        group.get::<ConfigMap>(KUBE_SYSTEM, "kubeadm-config").unwrap();
        let kube_proxy: DaemonSet = group.get(KUBE_SYSTEM, "kube-proxy").unwrap();
        let image = kube_proxy.spec.unwrap().template.spec.unwrap().containers[0]
            .image
            .clone()
            .unwrap();
        assert_eq!(image, "registry.k8s.io/kube-proxy:1.30.0");
        group.get::<ConfigMap>(KUBE_SYSTEM, "coredns").unwrap();
        group.get::<Deployment>(KUBE_SYSTEM, "coredns").unwrap();

        assert_eq!(env.listeners.etcd_members("workload-1"), vec!["etcd-cp-0"]);
        assert_eq!(
            env.listeners.api_servers("workload-1"),
            vec!["kube-apiserver-cp-0"]
        );
    }

    #[tokio::test]
    async fn advance_is_idempotent() {
        let env = env();
        let machine = cp_machine("cp-0");
        let mut tracker = ConditionsTracker::new("cp-0", "default");

        env.sequencer
            .advance(&env.cluster, &machine, &ReadyVm, &mut tracker)
            .await
            .unwrap();
        let group = env.groups.get_or_create(&env.cluster.resource_group());
        let objects = group.len();
        let revision = group.revision();

        let outcome = env
            .sequencer
            .advance(&env.cluster, &machine, &ReadyVm, &mut tracker)
            .await
            .unwrap();
        assert!(outcome.is_zero());
        assert_eq!(group.len(), objects);
        // Nothing was rewritten either.
        assert_eq!(group.revision(), revision);
        assert_eq!(env.listeners.etcd_members("workload-1").len(), 1);
    }

    #[tokio::test]
    async fn startup_delay_requeues_without_creating_objects() {
        let timings = StartupTimings {
            node: Duration::from_secs(3600),
            etcd: Duration::ZERO,
            api_server: Duration::ZERO,
            jitter: 0.3,
        };
        let env = env_with_timings(timings);
        let machine = cp_machine("cp-0");
        let mut tracker = ConditionsTracker::new("cp-0", "default");

        let outcome = env
            .sequencer
            .advance(&env.cluster, &machine, &ReadyVm, &mut tracker)
            .await
            .unwrap();

        let delay = outcome.requeue_after().expect("node phase must requeue");
        assert!(delay <= Duration::from_secs(3600 + 1080));

        let cond = conditions::get(&tracker, NODE_PROVISIONED_CONDITION).unwrap();
        assert_eq!(cond.reason, WAITING_FOR_STARTUP_TIMEOUT_REASON);
        // Later phases stay gated while the node is still starting up.
        assert!(!conditions::has(&tracker, ETCD_PROVISIONED_CONDITION));
        assert!(!conditions::has(&tracker, API_SERVER_PROVISIONED_CONDITION));
        let group = env.groups.get_or_create(&env.cluster.resource_group());
        assert!(group.get::<Node>("", "cp-0").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn startup_delay_is_counted_from_predecessor_transition() {
        let timings = StartupTimings {
            node: Duration::from_secs(3600),
            etcd: Duration::ZERO,
            api_server: Duration::ZERO,
            jitter: 0.3,
        };
        let env = env_with_timings(timings);
        let machine = cp_machine("cp-0");
        let mut tracker = ConditionsTracker::new("cp-0", "default");

        env.sequencer
            .advance(&env.cluster, &machine, &ReadyVm, &mut tracker)
            .await
            .unwrap();

        // Pretend the VM came up two hours ago; the hour-long (plus at most
        // 30% jitter) node startup has then already elapsed.
        let rewound = Utc::now() - chrono::Duration::hours(2);
        tracker
            .conditions_mut()
            .iter_mut()
            .find(|c| c.type_ == VM_PROVISIONED_CONDITION)
            .unwrap()
            .last_transition_time = rewound;

        let outcome = env
            .sequencer
            .advance(&env.cluster, &machine, &ReadyVm, &mut tracker)
            .await
            .unwrap();
        assert!(outcome.is_zero());
        assert!(conditions::is_true(&tracker, NODE_PROVISIONED_CONDITION));
        let group = env.groups.get_or_create(&env.cluster.resource_group());
        group.get::<Node>("", "cp-0").unwrap();
    }

    #[tokio::test]
    async fn members_join_one_etcd_cluster_with_a_single_leader() {
        let env = env();
        for name in ["cp-0", "cp-1", "cp-2"] {
            let machine = cp_machine(name);
            let mut tracker = ConditionsTracker::new(name, "default");
            let outcome = env
                .sequencer
                .advance(&env.cluster, &machine, &ReadyVm, &mut tracker)
                .await
                .unwrap();
            assert!(outcome.is_zero());
        }

        let group = env.groups.get_or_create(&env.cluster.resource_group());
        let pods: Vec<Pod> = group.list(KUBE_SYSTEM, ETCD_POD_SELECTOR).unwrap();
        assert_eq!(pods.len(), 3);

        let members: Vec<EtcdMember> = pods
            .iter()
            .map(|p| EtcdMember::from_pod(p).unwrap())
            .collect();
        let cluster_ids: BTreeSet<_> = members.iter().map(|m| m.cluster_id.clone()).collect();
        assert_eq!(cluster_ids.len(), 1);
        let member_ids: BTreeSet<_> = members.iter().map(|m| m.member_id.clone()).collect();
        assert_eq!(member_ids.len(), 3);
        let leaders = members.iter().filter(|m| m.leader_from.is_some()).count();
        assert_eq!(leaders, 1, "only the first member claims leadership");

        let info = etcd::cluster_info(&pods).unwrap().unwrap();
        assert_eq!(info.members.len(), 3);
        assert_eq!(env.listeners.etcd_members("workload-1").len(), 3);
    }

    #[tokio::test]
    async fn missing_etcd_ca_stops_the_sequence() {
        let groups = Arc::new(ResourceGroupRegistry::default());
        let listeners = Arc::new(WorkloadListeners::default());
        let cluster = Cluster::new("test", "default");
        listeners.register(&cluster.resource_group(), "workload-1");

        // No CAs provisioned at all.
        let sequencer = BootstrapSequencer::new(
            groups.clone(),
            listeners,
            Arc::new(StaticCaSecrets::default()),
        )
        .with_timings(StartupTimings::immediate())
        .with_rng_seed(7);

        let machine = cp_machine("cp-0");
        let mut tracker = ConditionsTracker::new("cp-0", "default");
        let err = sequencer
            .advance(&cluster, &machine, &ReadyVm, &mut tracker)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Secrets(_)));

        // The node phase completed, and the failure stopped everything
        // after etcd.
        assert!(conditions::is_true(&tracker, NODE_PROVISIONED_CONDITION));
        assert!(!conditions::is_true(&tracker, ETCD_PROVISIONED_CONDITION));
        let group = groups.get_or_create(&cluster.resource_group());
        assert!(group
            .get::<Pod>(KUBE_SYSTEM, "kube-apiserver-cp-0")
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn teardown_removes_objects_and_finalizer() {
        let env = env();
        let machine = cp_machine("cp-0");
        let mut tracker = ConditionsTracker::new("cp-0", "default");
        tracker.add_finalizer(VM_FINALIZER);

        env.sequencer
            .advance(&env.cluster, &machine, &ReadyVm, &mut tracker)
            .await
            .unwrap();

        let outcome = env
            .sequencer
            .teardown(&env.cluster, &machine, &mut tracker)
            .await
            .unwrap();
        assert!(outcome.is_zero());
        assert!(!tracker.has_finalizer(VM_FINALIZER));

        let group = env.groups.get_or_create(&env.cluster.resource_group());
        assert!(group.get::<Node>("", "cp-0").unwrap_err().is_not_found());
        for pod in [
            "etcd-cp-0",
            "kube-apiserver-cp-0",
            "kube-scheduler-cp-0",
            "kube-controller-manager-cp-0",
        ] {
            assert!(group.get::<Pod>(KUBE_SYSTEM, pod).unwrap_err().is_not_found());
        }
        assert!(env.listeners.etcd_members("workload-1").is_empty());
        assert!(env.listeners.api_servers("workload-1").is_empty());

        // Cluster-scoped objects survive the machine.
        group.get::<DaemonSet>(KUBE_SYSTEM, "kube-proxy").unwrap();
        group.get::<ConfigMap>(KUBE_SYSTEM, "coredns").unwrap();

        // Tearing down again has nothing to do and still succeeds.
        let outcome = env
            .sequencer
            .teardown(&env.cluster, &machine, &mut tracker)
            .await
            .unwrap();
        assert!(outcome.is_zero());
    }

    #[tokio::test]
    async fn worker_teardown_only_touches_the_node() {
        let env = env();
        let mut cluster = env.cluster.clone();
        conditions::mark_true(&mut cluster, CONTROL_PLANE_INITIALIZED_CONDITION);
        let machine = Machine::new("worker-0", "default", "1.30.0")
            .with_bootstrap_data("worker-0-bootstrap");
        let mut tracker = ConditionsTracker::new("worker-0", "default");
        tracker.add_finalizer(VM_FINALIZER);

        let outcome = env
            .sequencer
            .advance(&cluster, &machine, &ReadyVm, &mut tracker)
            .await
            .unwrap();
        assert!(outcome.is_zero());
        assert!(conditions::is_true(&tracker, NODE_PROVISIONED_CONDITION));
        assert!(!conditions::has(&tracker, ETCD_PROVISIONED_CONDITION));

        let group = env.groups.get_or_create(&cluster.resource_group());
        let node: Node = group.get("", "worker-0").unwrap();
        assert!(node.metadata.labels.is_none());

        env.sequencer
            .teardown(&cluster, &machine, &mut tracker)
            .await
            .unwrap();
        assert!(group.get::<Node>("", "worker-0").unwrap_err().is_not_found());
        assert!(!tracker.has_finalizer(VM_FINALIZER));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_members_keep_one_cluster_and_leader() {
        for _ in 0..10 {
            let env = env();
            let sequencer = Arc::new(env.sequencer);
            let cluster = env.cluster.clone();

            let mut handles = Vec::new();
            for name in ["cp-0", "cp-1", "cp-2"] {
                let sequencer = sequencer.clone();
                let cluster = cluster.clone();
                handles.push(tokio::spawn(async move {
                    let machine = cp_machine(name);
                    let mut tracker = ConditionsTracker::new(name, "default");
                    // A conflicting membership write fails the whole
                    // invocation; the caller retries, as a reconcile loop
                    // would.
                    for _ in 0..20 {
                        match sequencer
                            .advance(&cluster, &machine, &ReadyVm, &mut tracker)
                            .await
                        {
                            Ok(outcome) if outcome.is_zero() => return,
                            Ok(_) | Err(_) => {}
                        }
                    }
                    panic!("machine {} did not converge", name);
                }));
            }
            for handle in handles {
                handle.await.unwrap();
            }

            let group = env.groups.get_or_create(&cluster.resource_group());
            let pods: Vec<Pod> = group.list(KUBE_SYSTEM, ETCD_POD_SELECTOR).unwrap();
            assert_eq!(pods.len(), 3);
            let members: Vec<EtcdMember> = pods
                .iter()
                .map(|p| EtcdMember::from_pod(p).unwrap())
                .collect();
            let cluster_ids: BTreeSet<_> =
                members.iter().map(|m| m.cluster_id.clone()).collect();
            assert_eq!(cluster_ids.len(), 1, "members must share one cluster ID");
            let member_ids: BTreeSet<_> =
                members.iter().map(|m| m.member_id.clone()).collect();
            assert_eq!(member_ids.len(), 3, "member IDs must not collide");
            let leaders = members.iter().filter(|m| m.leader_from.is_some()).count();
            assert_eq!(leaders, 1, "racing first members must elect one leader");
        }
    }

    #[test]
    fn outcome_combination_keeps_lowest_non_zero_delay() {
        let done = Outcome::done();
        let short = Outcome::requeue(Duration::from_secs(5));
        let long = Outcome::requeue(Duration::from_secs(30));

        assert_eq!(done.lowest_non_zero(done), done);
        assert_eq!(done.lowest_non_zero(short), short);
        assert_eq!(short.lowest_non_zero(done), short);
        assert_eq!(short.lowest_non_zero(long), short);
        assert_eq!(long.lowest_non_zero(short), short);
    }

    #[test]
    fn bootstrap_phases_run_in_declared_order() {
        let names: Vec<&str> = BOOTSTRAP_PHASES.iter().map(|p| p.name).collect();
        assert_eq!(
            names,
            [
                "node",
                "etcd",
                "api-server",
                "scheduler",
                "controller-manager",
                "kubeadm-objects",
                "kube-proxy",
                "coredns",
            ]
        );
        // Only the node phase applies to workers.
        assert!(BOOTSTRAP_PHASES
            .iter()
            .all(|p| p.control_plane_only || p.name == "node"));
    }
}
