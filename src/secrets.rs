//! By-purpose lookup of cluster certificate authorities
//!
//! The sequencer needs two root CAs per workload cluster: the cluster CA
//! (serving material for simulated API servers) and the etcd CA (serving
//! material for simulated etcd members). Where they come from is the
//! caller's business; the trait here is the narrow seam the sequencer
//! consumes. Absence is a hard error for the phase requesting it.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use crate::api::Cluster;
use crate::pki::CertKeyPair;

/// Which certificate authority a lookup is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaPurpose {
    /// The cluster root CA, used for API server serving certs
    Cluster,
    /// The etcd root CA, used for etcd member serving certs
    Etcd,
}

impl CaPurpose {
    /// Conventional name of the secret holding this CA for a cluster
    pub fn secret_name(&self, cluster_name: &str) -> String {
        match self {
            CaPurpose::Cluster => format!("{}-ca", cluster_name),
            CaPurpose::Etcd => format!("{}-etcd", cluster_name),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            CaPurpose::Cluster => "cluster",
            CaPurpose::Etcd => "etcd",
        }
    }
}

/// Errors from CA lookups
#[derive(Debug, Error)]
pub enum SecretsError {
    /// The CA secret for the requested purpose does not exist
    #[error("{purpose} CA secret {namespace}/{name} not found")]
    NotFound {
        /// Purpose of the missing CA
        purpose: &'static str,
        /// Namespace the secret was looked up in
        namespace: String,
        /// Name the secret was looked up under
        name: String,
    },

    /// The CA secret exists but its material does not parse
    #[error("invalid {purpose} CA in {namespace}/{name}: {reason}")]
    Invalid {
        /// Purpose of the invalid CA
        purpose: &'static str,
        /// Namespace of the secret
        namespace: String,
        /// Name of the secret
        name: String,
        /// Why the material was rejected
        reason: String,
    },
}

/// Lookup of cluster certificate authorities by purpose
#[async_trait]
pub trait CaSecrets: Send + Sync {
    /// Fetch the CA for the given cluster and purpose
    async fn certificate_authority(
        &self,
        cluster: &Cluster,
        purpose: CaPurpose,
    ) -> Result<CertKeyPair, SecretsError>;
}

/// In-memory CA secrets, keyed by namespace and secret name
///
/// Backs tests and self-contained simulations; a management cluster
/// deployment would implement [`CaSecrets`] against its real secret store
/// instead.
#[derive(Debug, Default)]
pub struct StaticCaSecrets {
    entries: DashMap<(String, String), CertKeyPair>,
}

impl StaticCaSecrets {
    /// Store a CA under the given namespace and secret name
    pub fn insert(&self, namespace: &str, name: &str, pair: CertKeyPair) {
        self.entries
            .insert((namespace.to_string(), name.to_string()), pair);
    }

    /// Generate and store both root CAs for a cluster under their
    /// conventional secret names
    pub fn provision_cluster(&self, cluster: &Cluster) -> Result<(), crate::pki::PkiError> {
        self.insert(
            &cluster.namespace,
            &CaPurpose::Cluster.secret_name(&cluster.name),
            crate::pki::self_signed_ca("kubernetes")?,
        );
        self.insert(
            &cluster.namespace,
            &CaPurpose::Etcd.secret_name(&cluster.name),
            crate::pki::self_signed_ca("etcd")?,
        );
        Ok(())
    }
}

#[async_trait]
impl CaSecrets for StaticCaSecrets {
    async fn certificate_authority(
        &self,
        cluster: &Cluster,
        purpose: CaPurpose,
    ) -> Result<CertKeyPair, SecretsError> {
        let name = purpose.secret_name(&cluster.name);
        let pair = self
            .entries
            .get(&(cluster.namespace.clone(), name.clone()))
            .map(|e| e.clone())
            .ok_or_else(|| SecretsError::NotFound {
                purpose: purpose.as_str(),
                namespace: cluster.namespace.clone(),
                name: name.clone(),
            })?;

        pair.validate().map_err(|e| SecretsError::Invalid {
            purpose: purpose.as_str(),
            namespace: cluster.namespace.clone(),
            name,
            reason: e.to_string(),
        })?;

        Ok(pair)
    }
}
