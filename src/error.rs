//! Error types for the simulator

use std::fmt;

use thiserror::Error;

use crate::etcd::EtcdError;
use crate::pki::PkiError;
use crate::secrets::SecretsError;
use crate::server::ListenerError;
use crate::store::StoreError;

/// Main error type for simulator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Per-cluster store error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Etcd membership bookkeeping error
    #[error(transparent)]
    Etcd(#[from] EtcdError),

    /// Certificate material error
    #[error(transparent)]
    Pki(#[from] PkiError),

    /// CA secret lookup error
    #[error(transparent)]
    Secrets(#[from] SecretsError),

    /// Listener registry error
    #[error(transparent)]
    Listener(#[from] ListenerError),

    /// Multiple independent phase failures from one pass
    #[error("{0}")]
    Aggregate(AggregateError),
}

impl Error {
    /// Combine phase errors into one: none stays none, a single error is
    /// returned as-is, several become an aggregate
    pub fn aggregate(mut errors: Vec<Error>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => Some(errors.remove(0)),
            _ => Some(Error::Aggregate(AggregateError(errors))),
        }
    }
}

/// Several independent errors reported together without losing the
/// individual messages
#[derive(Debug)]
pub struct AggregateError(Vec<Error>);

impl AggregateError {
    /// The individual errors
    pub fn errors(&self) -> &[Error] {
        &self.0
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", err)?;
        }
        write!(f, "]")
    }
}

impl std::error::Error for AggregateError {}
