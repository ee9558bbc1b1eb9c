//! Network operator error abstractions.

use thiserror::Error;

/// A result type where the error is a `StoreError`.
pub type StoreResult<T> = ::std::result::Result<T, StoreError>;

/// Error variants returned from the object store.
///
/// Only `NotFound` and `AlreadyExists` carry meaning for the election protocol, everything
/// else is opaque and treated as fatal by callers.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested object does not exist.
    #[error("object not found")]
    NotFound,
    /// An object with the same namespace & name already exists.
    #[error("object already exists")]
    AlreadyExists,
    /// Any other error returned from the store.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<kube::Error> for StoreError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => Self::NotFound,
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => Self::AlreadyExists,
            err => Self::Other(anyhow::Error::new(err)),
        }
    }
}

/// Error variants returned from the leader election routine.
#[derive(Debug, Error)]
pub enum ElectionError {
    /// The operator namespace could not be read from the environment.
    #[error("error reading operator namespace")]
    Namespace(#[source] std::io::Error),
    /// The identity of this process could not be resolved.
    #[error("error resolving operator pod identity: {0}")]
    Identity(String),
    /// The store returned an unrecoverable error.
    #[error("error {action}")]
    Store {
        action: &'static str,
        #[source]
        source: StoreError,
    },
    /// The election was cancelled by a shutdown signal while waiting.
    #[error("leader election cancelled")]
    Cancelled,
}

impl ElectionError {
    /// Build a closure which wraps a store error with the action which produced it.
    pub(crate) fn store(action: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| Self::Store { action, source }
    }
}
