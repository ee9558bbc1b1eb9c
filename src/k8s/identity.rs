//! Resolution of this process's scope & identity, and liveness of other lock holders.

use std::io::ErrorKind;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

use crate::config::{IdentityConfig, RunMode};
use crate::error::ElectionError;

/// The kind of object which owns a leader lock.
pub const OWNER_KIND: &str = "Pod";
/// The API version of the object which owns a leader lock.
pub const OWNER_API_VERSION: &str = "v1";

const POD_PHASE_FAILED: &str = "Failed";
const POD_REASON_EVICTED: &str = "Evicted";

/// The reasons for which an operator namespace could not be resolved.
#[derive(Debug)]
pub enum NamespaceError {
    /// No namespace is available, the process is not running in a cluster.
    NoNamespace,
    /// The process has been explicitly configured to run locally.
    RunLocal,
    /// The namespace file exists but could not be read.
    Io(std::io::Error),
}

/// Resolve the namespace in which this operator is running.
pub fn operator_namespace(config: &IdentityConfig) -> Result<String, NamespaceError> {
    if config.run_mode == RunMode::Local {
        return Err(NamespaceError::RunLocal);
    }
    if let Some(ns) = config.operator_namespace.as_deref().map(str::trim).filter(|ns| !ns.is_empty()) {
        return Ok(ns.to_string());
    }
    let raw = match std::fs::read_to_string(&config.service_account_namespace_path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Err(NamespaceError::NoNamespace),
        Err(err) => return Err(NamespaceError::Io(err)),
    };
    let ns = raw.trim();
    if ns.is_empty() {
        return Err(NamespaceError::NoNamespace);
    }
    Ok(ns.to_string())
}

/// Resolve the name of the pod on which this operator is running.
pub fn pod_name(config: &IdentityConfig) -> Result<String, ElectionError> {
    config
        .pod_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(String::from)
        .ok_or_else(|| ElectionError::Identity("required env POD_NAME not set, please configure downward API".into()))
}

/// The identity of this process, fixed for its lifetime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessIdentity {
    /// The name of this process's pod.
    pub name: String,
    /// The UID of this process's pod.
    pub uid: String,
}

impl ProcessIdentity {
    /// Build an identity from this process's own pod.
    pub fn from_pod(pod: &Pod) -> Result<Self, ElectionError> {
        let name = pod.metadata.name.clone().ok_or_else(|| ElectionError::Identity("operator pod has no name".into()))?;
        let uid = pod
            .metadata
            .uid
            .clone()
            .ok_or_else(|| ElectionError::Identity(format!("operator pod {} has no uid", name)))?;
        Ok(Self { name, uid })
    }

    /// The owner reference to place on a lock held by this process.
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: OWNER_API_VERSION.into(),
            kind: OWNER_KIND.into(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            ..Default::default()
        }
    }

    /// Check if the given owner reference points at this process.
    ///
    /// An empty UID on the reference is treated as a wildcard.
    pub fn matches(&self, owner: &OwnerReference) -> bool {
        owner.name == self.name && (owner.uid.is_empty() || owner.uid == self.uid)
    }
}

/// The observed liveness of a lock holder's pod.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HolderLiveness {
    /// The holder's pod no longer exists, the lock is pending garbage collection.
    Gone,
    /// The holder's pod has been evicted and is not yet marked for deletion.
    Evicted,
    /// The holder's pod has been evicted and is already being deleted.
    Terminating,
    /// The holder's pod is alive as far as can be observed.
    Healthy,
}

impl HolderLiveness {
    /// Determine the liveness of the given holder pod.
    pub fn of(pod: &Pod) -> Self {
        if !is_pod_evicted(pod) {
            return Self::Healthy;
        }
        if pod.metadata.deletion_timestamp.is_some() {
            Self::Terminating
        } else {
            Self::Evicted
        }
    }

    /// Determine the liveness of the pod named by the given owner reference.
    ///
    /// A pod with the owner's name but a different UID is a later incarnation, and the owner
    /// itself is gone.
    pub fn of_owner(owner: &OwnerReference, pod: &Pod) -> Self {
        if !owner.uid.is_empty() && pod.metadata.uid.as_deref() != Some(owner.uid.as_str()) {
            return Self::Gone;
        }
        Self::of(pod)
    }
}

/// Info on the current holder of a lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HolderInfo {
    /// The name of the holder's pod.
    pub name: String,
    /// The observed liveness of the holder's pod.
    pub liveness: HolderLiveness,
}

fn is_pod_evicted(pod: &Pod) -> bool {
    let status = match pod.status.as_ref() {
        Some(status) => status,
        None => return false,
    };
    status.phase.as_deref() == Some(POD_PHASE_FAILED) && status.reason.as_deref() == Some(POD_REASON_EVICTED)
}
