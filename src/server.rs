//! Workload cluster listener registry
//!
//! Every simulated workload cluster has one network listener that the test
//! infrastructure multiplexes API server traffic onto. This module tracks
//! which simulated etcd members and API server instances are attached to
//! which listener; the actual TCP termination lives outside this crate.
//!
//! Serving material for each attached instance is minted from the root CA
//! handed in at registration time, so the listener can terminate TLS the
//! way a real member would.

use dashmap::DashMap;
use thiserror::Error;

use crate::pki::{self, CertKeyPair, PkiError};

/// Errors from the listener registry
#[derive(Debug, Error)]
pub enum ListenerError {
    /// No listener is registered for the resource group
    #[error("no listener registered for resource group {0}")]
    UnknownResourceGroup(String),

    /// No listener with the given name exists
    #[error("no listener named {0}")]
    UnknownListener(String),

    /// Minting serving material for the instance failed
    #[error(transparent)]
    Pki(#[from] PkiError),
}

/// Registry of simulated control plane instances per workload cluster
///
/// The narrow seam the sequencer talks to; registration state is queried,
/// never cached locally, so re-entrant reconciliations stay idempotent.
pub trait ControlPlaneListeners: Send + Sync {
    /// Resolve the listener serving the given resource group
    fn listener_by_resource_group(&self, resource_group: &str) -> Result<String, ListenerError>;

    /// Whether the named etcd member is attached to the listener
    fn has_etcd_member(&self, listener: &str, member: &str) -> bool;

    /// Attach a simulated etcd member, minting its serving material from
    /// the etcd root CA
    fn add_etcd_member(
        &self,
        listener: &str,
        member: &str,
        ca: &CertKeyPair,
    ) -> Result<(), ListenerError>;

    /// Detach a simulated etcd member; detaching an unknown member is a
    /// no-op
    fn delete_etcd_member(&self, listener: &str, member: &str) -> Result<(), ListenerError>;

    /// Whether the named API server instance is attached to the listener
    fn has_api_server(&self, listener: &str, name: &str) -> bool;

    /// Attach a simulated API server instance, minting its serving
    /// material from the cluster root CA
    fn add_api_server(
        &self,
        listener: &str,
        name: &str,
        ca: &CertKeyPair,
    ) -> Result<(), ListenerError>;

    /// Detach a simulated API server instance; detaching an unknown
    /// instance is a no-op
    fn delete_api_server(&self, listener: &str, name: &str) -> Result<(), ListenerError>;
}

#[derive(Debug, Default)]
struct Listener {
    etcd_members: DashMap<String, CertKeyPair>,
    api_servers: DashMap<String, CertKeyPair>,
}

/// In-memory listener registry
#[derive(Debug, Default)]
pub struct WorkloadListeners {
    by_resource_group: DashMap<String, String>,
    listeners: DashMap<String, Listener>,
}

impl WorkloadListeners {
    /// Register a listener for a workload cluster's resource group
    pub fn register(&self, resource_group: &str, listener: &str) {
        self.by_resource_group
            .insert(resource_group.to_string(), listener.to_string());
        self.listeners
            .entry(listener.to_string())
            .or_default();
    }

    /// Names of the etcd members attached to the listener
    pub fn etcd_members(&self, listener: &str) -> Vec<String> {
        self.listeners
            .get(listener)
            .map(|l| l.etcd_members.iter().map(|e| e.key().clone()).collect())
            .unwrap_or_default()
    }

    /// Names of the API server instances attached to the listener
    pub fn api_servers(&self, listener: &str) -> Vec<String> {
        self.listeners
            .get(listener)
            .map(|l| l.api_servers.iter().map(|e| e.key().clone()).collect())
            .unwrap_or_default()
    }
}

impl ControlPlaneListeners for WorkloadListeners {
    fn listener_by_resource_group(&self, resource_group: &str) -> Result<String, ListenerError> {
        self.by_resource_group
            .get(resource_group)
            .map(|l| l.clone())
            .ok_or_else(|| ListenerError::UnknownResourceGroup(resource_group.to_string()))
    }

    fn has_etcd_member(&self, listener: &str, member: &str) -> bool {
        self.listeners
            .get(listener)
            .map_or(false, |l| l.etcd_members.contains_key(member))
    }

    fn add_etcd_member(
        &self,
        listener: &str,
        member: &str,
        ca: &CertKeyPair,
    ) -> Result<(), ListenerError> {
        let entry = self
            .listeners
            .get(listener)
            .ok_or_else(|| ListenerError::UnknownListener(listener.to_string()))?;
        if entry.etcd_members.contains_key(member) {
            return Ok(());
        }
        let serving = pki::serving_cert(member, ca)?;
        entry.etcd_members.insert(member.to_string(), serving);
        Ok(())
    }

    fn delete_etcd_member(&self, listener: &str, member: &str) -> Result<(), ListenerError> {
        let entry = self
            .listeners
            .get(listener)
            .ok_or_else(|| ListenerError::UnknownListener(listener.to_string()))?;
        entry.etcd_members.remove(member);
        Ok(())
    }

    fn has_api_server(&self, listener: &str, name: &str) -> bool {
        self.listeners
            .get(listener)
            .map_or(false, |l| l.api_servers.contains_key(name))
    }

    fn add_api_server(
        &self,
        listener: &str,
        name: &str,
        ca: &CertKeyPair,
    ) -> Result<(), ListenerError> {
        let entry = self
            .listeners
            .get(listener)
            .ok_or_else(|| ListenerError::UnknownListener(listener.to_string()))?;
        if entry.api_servers.contains_key(name) {
            return Ok(());
        }
        let serving = pki::serving_cert(name, ca)?;
        entry.api_servers.insert(name.to_string(), serving);
        Ok(())
    }

    fn delete_api_server(&self, listener: &str, name: &str) -> Result<(), ListenerError> {
        let entry = self
            .listeners
            .get(listener)
            .ok_or_else(|| ListenerError::UnknownListener(listener.to_string()))?;
        entry.api_servers.remove(name);
        Ok(())
    }
}
