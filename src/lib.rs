//! vcsim - in-memory workload cluster control plane simulator
//!
//! vcsim fakes the provisioning of Kubernetes control plane components for
//! cluster lifecycle testing: given a machine and its backing VM, it walks
//! an ordered sequence of bootstrap phases (node, etcd member, API server,
//! scheduler, controller manager, supporting cluster objects) and records
//! progress as conditions on a per-machine tracker. Components come up
//! after configurable jittered delays rather than instantly, so tests
//! exercise the same partially-provisioned states a real cluster goes
//! through.
//!
//! Nothing here talks to a real cluster. Every simulated workload cluster
//! gets an isolated in-memory resource group holding its objects, and etcd
//! "membership" is bookkeeping annotations on the member pods.
//!
//! # Modules
//!
//! - [`api`] - Minimal cluster and machine shapes consumed by the sequencer
//! - [`bootstrap`] - The per-machine bootstrap and deletion sequencer
//! - [`conditions`] - Conditions and the per-machine conditions tracker
//! - [`etcd`] - Etcd membership bookkeeping on member pod annotations
//! - [`pki`] - Root CA and serving certificate generation
//! - [`secrets`] - By-purpose lookup of cluster certificate authorities
//! - [`server`] - Workload cluster listener registry
//! - [`store`] - Per-cluster in-memory object store
//! - [`error`] - Error types for the simulator

#![deny(missing_docs)]

pub mod api;
pub mod bootstrap;
pub mod conditions;
pub mod error;
pub mod etcd;
pub mod pki;
pub mod secrets;
pub mod server;
pub mod store;

pub use error::Error;

/// Result type alias using the simulator [`Error`]
pub type Result<T> = std::result::Result<T, Error>;
