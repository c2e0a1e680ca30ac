//! Etcd membership bookkeeping
//!
//! The simulated etcd cluster is not a consensus protocol; it is
//! bookkeeping on the member pods. Each member pod carries annotations for
//! the cluster ID (shared by every member of one logical cluster), its own
//! member ID, an optional leader-from timestamp, and a removed marker.
//! Leadership belongs to the non-removed member with the most recent
//! leader-from value; transferring leadership is a single annotation write
//! on the target member.
//!
//! Aggregate membership is never persisted: it is recomputed from the pods
//! on every read, and inconsistencies are hard errors rather than silently
//! repaired, since automatic recovery could mask a real double-bootstrap.

use std::collections::BTreeSet;

use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rand::Rng;
use thiserror::Error;

/// Annotation tracking the etcd cluster ID of the member a pod represents
pub const CLUSTER_ID_ANNOTATION: &str =
    "etcd.inmemory.infrastructure.cluster.x-k8s.io/cluster-id";

/// Annotation tracking the member ID of the member a pod represents
pub const MEMBER_ID_ANNOTATION: &str = "etcd.inmemory.infrastructure.cluster.x-k8s.io/member-id";

/// Annotation tracking since when the member has been leader; the member
/// with the most recent value is the current leader
pub const LEADER_FROM_ANNOTATION: &str =
    "etcd.inmemory.infrastructure.cluster.x-k8s.io/leader-from";

/// Annotation marking a member as removed from the etcd cluster without
/// deleting its pod
pub const MEMBER_REMOVED_ANNOTATION: &str =
    "etcd.inmemory.infrastructure.cluster.x-k8s.io/member-removed";

/// Errors from membership bookkeeping
#[derive(Debug, Error)]
pub enum EtcdError {
    /// A member pod lacks a required bookkeeping annotation
    #[error("etcd member pod {pod} is missing the {annotation} annotation")]
    MissingAnnotation {
        /// Name of the malformed pod
        pod: String,
        /// The missing annotation key
        annotation: &'static str,
    },

    /// A member pod carries an unparseable leader-from timestamp
    #[error("etcd member pod {pod} has an invalid leader-from timestamp {value:?}")]
    InvalidLeaderFrom {
        /// Name of the malformed pod
        pod: String,
        /// The rejected annotation value
        value: String,
    },

    /// Non-removed members disagree on the cluster ID
    #[error("invalid etcd cluster, members have different cluster ID")]
    MixedClusterIds,

    /// No non-removed member carries leadership
    #[error("invalid etcd cluster, no leader found")]
    NoLeader,
}

/// Typed view of one member's bookkeeping annotations
///
/// Parsed from a member pod at the boundary; malformed annotations are
/// errors, not defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcdMember {
    /// Cluster ID shared by all members of the logical cluster
    pub cluster_id: String,

    /// This member's unique ID
    pub member_id: String,

    /// Since when this member has held leadership, if ever
    pub leader_from: Option<DateTime<Utc>>,

    /// Whether the member has been removed from the cluster
    pub removed: bool,
}

impl EtcdMember {
    /// Create a member record with no leadership claim
    pub fn new(cluster_id: impl Into<String>, member_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            member_id: member_id.into(),
            leader_from: None,
            removed: false,
        }
    }

    /// Claim leadership from the given instant
    pub fn with_leadership(mut self, since: DateTime<Utc>) -> Self {
        self.leader_from = Some(since);
        self
    }

    /// Parse the member record out of a pod's annotations
    pub fn from_pod(pod: &Pod) -> Result<Self, EtcdError> {
        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        let annotations = pod.metadata.annotations.as_ref();
        let lookup = |key: &'static str| -> Result<String, EtcdError> {
            annotations
                .and_then(|a| a.get(key))
                .cloned()
                .ok_or(EtcdError::MissingAnnotation {
                    pod: pod_name.clone(),
                    annotation: key,
                })
        };

        let cluster_id = lookup(CLUSTER_ID_ANNOTATION)?;
        let member_id = lookup(MEMBER_ID_ANNOTATION)?;

        let leader_from = match annotations.and_then(|a| a.get(LEADER_FROM_ANNOTATION)) {
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(raw)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|_| EtcdError::InvalidLeaderFrom {
                        pod: pod_name.clone(),
                        value: raw.clone(),
                    })?,
            ),
            None => None,
        };

        let removed =
            annotations.map_or(false, |a| a.contains_key(MEMBER_REMOVED_ANNOTATION));

        Ok(Self {
            cluster_id,
            member_id,
            leader_from,
            removed,
        })
    }

    /// Write the member record into an object's annotations
    pub fn apply_to(&self, meta: &mut ObjectMeta) {
        let annotations = meta.annotations.get_or_insert_with(Default::default);
        annotations.insert(CLUSTER_ID_ANNOTATION.to_string(), self.cluster_id.clone());
        annotations.insert(MEMBER_ID_ANNOTATION.to_string(), self.member_id.clone());
        match self.leader_from {
            Some(since) => {
                annotations.insert(
                    LEADER_FROM_ANNOTATION.to_string(),
                    since.to_rfc3339_opts(SecondsFormat::Secs, true),
                );
            }
            None => {
                annotations.remove(LEADER_FROM_ANNOTATION);
            }
        }
        if self.removed {
            annotations.insert(MEMBER_REMOVED_ANNOTATION.to_string(), String::new());
        } else {
            annotations.remove(MEMBER_REMOVED_ANNOTATION);
        }
    }
}

/// Aggregate membership state, computed from the member pods at read time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EtcdClusterInfo {
    /// Cluster ID shared by all non-removed members
    pub cluster_id: String,

    /// Member ID of the current leader
    pub leader_id: String,

    /// Member IDs currently in use, including the leader's
    pub members: BTreeSet<String>,
}

/// Compute aggregate membership from the etcd member pods
///
/// Removed members are skipped. Returns `Ok(None)` when no member pods
/// exist yet (a cluster being created). Fails when non-removed members
/// disagree on the cluster ID or no non-removed member holds leadership.
pub fn cluster_info(pods: &[Pod]) -> Result<Option<EtcdClusterInfo>, EtcdError> {
    if pods.is_empty() {
        return Ok(None);
    }

    let mut info = EtcdClusterInfo::default();
    let mut leader_from: Option<DateTime<Utc>> = None;
    for pod in pods {
        let member = EtcdMember::from_pod(pod)?;
        if member.removed {
            continue;
        }
        if info.cluster_id.is_empty() {
            info.cluster_id = member.cluster_id.clone();
        } else if member.cluster_id != info.cluster_id {
            return Err(EtcdError::MixedClusterIds);
        }
        info.members.insert(member.member_id.clone());

        if let Some(since) = member.leader_from {
            if leader_from.map_or(true, |current| since > current) {
                info.leader_id = member.member_id.clone();
                leader_from = Some(since);
            }
        }
    }

    if info.leader_id.is_empty() {
        return Err(EtcdError::NoLeader);
    }

    Ok(Some(info))
}

/// Mint a new non-zero cluster ID
pub fn mint_cluster_id<R: Rng>(rng: &mut R) -> String {
    loop {
        let id = rng.gen::<u32>();
        if id != 0 {
            return id.to_string();
        }
    }
}

/// Mint a non-zero member ID not colliding with any ID already in use
pub fn mint_member_id<R: Rng>(rng: &mut R, in_use: &BTreeSet<String>) -> String {
    loop {
        let id = rng.gen::<u32>();
        if id == 0 {
            continue;
        }
        let id = id.to_string();
        if !in_use.contains(&id) {
            return id;
        }
    }
}
