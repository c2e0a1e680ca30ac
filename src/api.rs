//! Minimal cluster and machine shapes consumed by the sequencer
//!
//! The real cluster lifecycle CRDs live outside this crate; the sequencer
//! only reads a handful of their fields, modeled here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::conditions::{Condition, Conditions};

/// Label marking a machine as part of the control plane
pub const CONTROL_PLANE_LABEL: &str = "cluster.x-k8s.io/control-plane";

/// Cluster-level condition signaling that the control plane has been
/// initialized; workers wait on it before bootstrap data can appear
pub const CONTROL_PLANE_INITIALIZED_CONDITION: &str = "ControlPlaneInitialized";

/// The cluster owning the machines being reconciled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    /// Cluster name
    pub name: String,

    /// Cluster namespace
    pub namespace: String,

    /// Cluster-level conditions
    pub conditions: Vec<Condition>,
}

impl Cluster {
    /// Create a cluster with no conditions set
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            conditions: Vec::new(),
        }
    }

    /// Unique name of the resource group backing this cluster's simulated
    /// objects
    pub fn resource_group(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl Conditions for Cluster {
    fn get_conditions(&self) -> &[Condition] {
        &self.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }
}

/// The machine being reconciled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    /// Machine name
    pub name: String,

    /// Machine namespace
    pub namespace: String,

    /// Machine labels; control plane membership is derived from
    /// [`CONTROL_PLANE_LABEL`]
    pub labels: BTreeMap<String, String>,

    /// Reference to the bootstrap data secret, once the bootstrap provider
    /// has produced it; the content is opaque to this crate
    pub bootstrap_data_secret: Option<String>,

    /// Kubernetes version the machine runs
    pub version: String,
}

impl Machine {
    /// Create a worker machine with no bootstrap data attached
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels: BTreeMap::new(),
            bootstrap_data_secret: None,
            version: version.into(),
        }
    }

    /// Mark the machine as a control plane machine
    pub fn control_plane(mut self) -> Self {
        self.labels
            .insert(CONTROL_PLANE_LABEL.to_string(), String::new());
        self
    }

    /// Attach the bootstrap data secret reference
    pub fn with_bootstrap_data(mut self, secret: impl Into<String>) -> Self {
        self.bootstrap_data_secret = Some(secret.into());
        self
    }

    /// Whether the machine belongs to the control plane
    pub fn is_control_plane(&self) -> bool {
        self.labels.contains_key(CONTROL_PLANE_LABEL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions;

    #[test]
    fn control_plane_membership_from_label() {
        let worker = Machine::new("worker-0", "default", "1.30.0");
        assert!(!worker.is_control_plane());

        let cp = Machine::new("cp-0", "default", "1.30.0").control_plane();
        assert!(cp.is_control_plane());
    }

    #[test]
    fn resource_group_is_namespaced() {
        let cluster = Cluster::new("test", "ns-1");
        assert_eq!(cluster.resource_group(), "ns-1/test");
    }

    #[test]
    fn cluster_conditions_gate() {
        let mut cluster = Cluster::new("test", "default");
        assert!(!conditions::is_true(
            &cluster,
            CONTROL_PLANE_INITIALIZED_CONDITION
        ));

        conditions::mark_true(&mut cluster, CONTROL_PLANE_INITIALIZED_CONDITION);
        assert!(conditions::is_true(
            &cluster,
            CONTROL_PLANE_INITIALIZED_CONDITION
        ));
    }
}
