//! Conditions and the per-machine conditions tracker
//!
//! Conditions are the gating mechanism of the bootstrap sequencer: every
//! phase records how far it got as a named, timestamped status flag, and
//! later phases only run once the flag they depend on is `True`.
//!
//! The tracker is a lightweight shadow of the machine being reconciled.
//! It is created lazily on first reconciliation and mutated on every pass;
//! it is never deleted by this crate (cleanup follows the owning object's
//! lifecycle).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    /// The condition is satisfied
    True,
    /// The condition is not satisfied
    False,
    /// The state of the condition is not known
    Unknown,
}

/// Severity classification for a `False` condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionSeverity {
    /// The condition blocks progress and needs attention
    Error,
    /// The condition is unexpected but progress can continue
    Warning,
    /// The condition is part of normal operation (e.g. a startup wait)
    Info,
}

/// A typed, timestamped status flag
///
/// `last_transition_time` only changes when `status` or `reason` actually
/// change; repeated sets with identical state keep the original timestamp.
/// The provisioning-delay model depends on this: phase start times are read
/// from the predecessor condition's transition time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    /// Type of condition (e.g. NodeProvisioned)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the current status
    pub reason: String,

    /// Severity of the condition when status is False
    pub severity: ConditionSeverity,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned between states
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

/// Access to an ordered set of conditions, keyed by type
///
/// Implemented by the [`ConditionsTracker`] and by the cluster object, so
/// the same helpers work for machine-level and cluster-level gates.
pub trait Conditions {
    /// The ordered set of conditions
    fn get_conditions(&self) -> &[Condition];

    /// Mutable access to the ordered set of conditions
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;

    /// Replace the full ordered set of conditions
    fn set_conditions(&mut self, conditions: Vec<Condition>) {
        *self.conditions_mut() = conditions;
    }
}

/// Get the condition with the given type, if present
pub fn get<'a, T: Conditions + ?Sized>(holder: &'a T, type_: &str) -> Option<&'a Condition> {
    holder.get_conditions().iter().find(|c| c.type_ == type_)
}

/// Whether a condition with the given type exists, regardless of status
pub fn has<T: Conditions + ?Sized>(holder: &T, type_: &str) -> bool {
    get(holder, type_).is_some()
}

/// Whether the condition with the given type exists and is `True`
pub fn is_true<T: Conditions + ?Sized>(holder: &T, type_: &str) -> bool {
    get(holder, type_).map(|c| c.status == ConditionStatus::True) == Some(true)
}

/// Mark the condition with the given type as `True`
pub fn mark_true<T: Conditions + ?Sized>(holder: &mut T, type_: &str) {
    set(
        holder,
        Condition {
            type_: type_.to_string(),
            status: ConditionStatus::True,
            reason: String::new(),
            severity: ConditionSeverity::Info,
            message: String::new(),
            last_transition_time: Utc::now(),
        },
    );
}

/// Mark the condition with the given type as `False` with the given reason
pub fn mark_false<T: Conditions + ?Sized>(
    holder: &mut T,
    type_: &str,
    reason: &str,
    severity: ConditionSeverity,
    message: &str,
) {
    set(
        holder,
        Condition {
            type_: type_.to_string(),
            status: ConditionStatus::False,
            reason: reason.to_string(),
            severity,
            message: message.to_string(),
            last_transition_time: Utc::now(),
        },
    );
}

/// Set a condition, preserving the transition time when status and reason
/// are unchanged
fn set<T: Conditions + ?Sized>(holder: &mut T, condition: Condition) {
    let conditions = holder.conditions_mut();
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status && existing.reason == condition.reason {
                existing.severity = condition.severity;
                existing.message = condition.message;
            } else {
                *existing = condition;
            }
        }
        None => conditions.push(condition),
    }
}

/// Per-machine record of bootstrap progress
///
/// Shares name and namespace with the machine it shadows. Besides the
/// conditions it also carries the machine's finalizers, so the deletion
/// sequencer can release the provisioning finalizer once teardown has
/// nothing left to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionsTracker {
    /// Name of the machine this tracker shadows
    pub name: String,

    /// Namespace of the machine this tracker shadows
    pub namespace: String,

    finalizers: Vec<String>,
    conditions: Vec<Condition>,
}

impl ConditionsTracker {
    /// Create an empty tracker for the machine with the given name and
    /// namespace
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            finalizers: Vec::new(),
            conditions: Vec::new(),
        }
    }

    /// Add a finalizer if not already present
    pub fn add_finalizer(&mut self, finalizer: &str) {
        if !self.has_finalizer(finalizer) {
            self.finalizers.push(finalizer.to_string());
        }
    }

    /// Whether the given finalizer is present
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Remove the given finalizer if present
    pub fn remove_finalizer(&mut self, finalizer: &str) {
        self.finalizers.retain(|f| f != finalizer);
    }
}

impl Conditions for ConditionsTracker {
    fn get_conditions(&self) -> &[Condition] {
        &self.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_false_then_true_transitions() {
        let mut tracker = ConditionsTracker::new("machine-0", "default");
        assert!(!has(&tracker, "NodeProvisioned"));

        mark_false(
            &mut tracker,
            "NodeProvisioned",
            "WaitingForStartupTimeout",
            ConditionSeverity::Info,
            "",
        );
        assert!(has(&tracker, "NodeProvisioned"));
        assert!(!is_true(&tracker, "NodeProvisioned"));

        mark_true(&mut tracker, "NodeProvisioned");
        assert!(is_true(&tracker, "NodeProvisioned"));
    }

    #[test]
    fn repeated_set_keeps_transition_time() {
        let mut tracker = ConditionsTracker::new("machine-0", "default");

        mark_false(
            &mut tracker,
            "EtcdProvisioned",
            "WaitingForStartupTimeout",
            ConditionSeverity::Info,
            "first",
        );
        let first = get(&tracker, "EtcdProvisioned")
            .map(|c| c.last_transition_time)
            .expect("condition set");

        // Same status and reason: the timestamp must not move, even when
        // the message changes.
        mark_false(
            &mut tracker,
            "EtcdProvisioned",
            "WaitingForStartupTimeout",
            ConditionSeverity::Info,
            "second",
        );
        let cond = get(&tracker, "EtcdProvisioned").expect("condition set");
        assert_eq!(cond.last_transition_time, first);
        assert_eq!(cond.message, "second");

        // Status change: the timestamp moves.
        mark_true(&mut tracker, "EtcdProvisioned");
        let cond = get(&tracker, "EtcdProvisioned").expect("condition set");
        assert!(cond.last_transition_time >= first);
        assert_eq!(cond.status, ConditionStatus::True);
    }

    #[test]
    fn conditions_are_unique_per_type() {
        let mut tracker = ConditionsTracker::new("machine-0", "default");
        mark_false(
            &mut tracker,
            "VMProvisioned",
            "WaitingForBootstrapData",
            ConditionSeverity::Info,
            "",
        );
        mark_true(&mut tracker, "VMProvisioned");
        mark_true(&mut tracker, "VMProvisioned");
        assert_eq!(tracker.get_conditions().len(), 1);
    }

    #[test]
    fn finalizer_bookkeeping() {
        let mut tracker = ConditionsTracker::new("machine-0", "default");
        tracker.add_finalizer("vcsim.infrastructure.cluster.x-k8s.io");
        tracker.add_finalizer("vcsim.infrastructure.cluster.x-k8s.io");
        assert!(tracker.has_finalizer("vcsim.infrastructure.cluster.x-k8s.io"));

        tracker.remove_finalizer("vcsim.infrastructure.cluster.x-k8s.io");
        assert!(!tracker.has_finalizer("vcsim.infrastructure.cluster.x-k8s.io"));
    }
}
