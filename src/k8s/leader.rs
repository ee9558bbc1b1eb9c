//! Leader election built around a ConfigMap lock owned by the leader's pod.
//!
//! The first pod to create the lock becomes the leader, and remains the leader for the rest of
//! its life. There is no renewal or release: when the leader's pod is deleted, the lock is
//! garbage collected by K8s via its owner reference, and another candidate may then create it.
//!
//! Candidates never delete the lock themselves. The only remediation they perform is deleting
//! the leader's pod once it has been evicted, as evicted pods are otherwise left in place and
//! would block garbage collection of the lock indefinitely.

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use tokio::sync::{broadcast, watch};

use crate::config::ElectionConfig;
use crate::error::{ElectionError, StoreError};
use crate::k8s::backoff::Backoff;
use crate::k8s::identity::{self, HolderInfo, HolderLiveness, NamespaceError, ProcessIdentity, OWNER_KIND};
use crate::k8s::ObjectStore;

const METRIC_IS_LEADER: &str = "network_operator_is_leader";

/// The states which a leader elector moves through.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ElectionState {
    /// Resolving the namespace & pod identity of this process.
    ResolvingIdentity,
    /// No other holder has been observed yet, about to attempt creation of the lock.
    Uncontested,
    /// The lock is held by another pod, waiting for the given nominal backoff before retrying.
    Contending { backoff: std::time::Duration },
    /// The lock is held by this process.
    Held,
    /// Leader election was skipped as this process is not running in a cluster.
    Skipped,
}

/// A task which acquires the leader lock for this process.
pub struct LeaderElector<S> {
    /// The store holding the lock & pod objects.
    store: S,
    /// Leader election config.
    config: ElectionConfig,
    /// Sender for the current state of the election.
    state_tx: watch::Sender<ElectionState>,
}

impl<S: ObjectStore> LeaderElector<S> {
    /// Create a new instance.
    pub fn new(store: S, config: ElectionConfig) -> (Self, watch::Receiver<ElectionState>) {
        metrics::register_gauge!(
            METRIC_IS_LEADER,
            metrics::Unit::Count,
            "a gauge indicating if this pod holds the leader lock, where 1.0 indicates leadership, any other value does not"
        );
        let (state_tx, state_rx) = watch::channel(ElectionState::ResolvingIdentity);
        (Self { store, config, state_tx }, state_rx)
    }

    /// Block until this process holds the named lock.
    ///
    /// Returns immediately if this process is not running in a cluster. Contention is retried
    /// indefinitely with backoff, and only a signal on `shutdown` or an unrecoverable store error
    /// will abort the wait.
    #[tracing::instrument(level = "debug", skip(self, shutdown), err)]
    pub async fn become_leader(&self, lock_name: &str, shutdown: &mut broadcast::Receiver<()>) -> Result<(), ElectionError> {
        tracing::info!("trying to become the leader");
        self.set_state(ElectionState::ResolvingIdentity);
        let ns = match identity::operator_namespace(&self.config.identity) {
            Ok(ns) => ns,
            Err(NamespaceError::NoNamespace) | Err(NamespaceError::RunLocal) => {
                tracing::info!("skipping leader election, not running in a cluster");
                self.set_state(ElectionState::Skipped);
                return Ok(());
            }
            Err(NamespaceError::Io(err)) => return Err(ElectionError::Namespace(err)),
        };
        let me = self.resolve_identity(&ns).await?;
        tracing::debug!(namespace = %ns, pod = %me.name, uid = %me.uid, "resolved operator identity");

        // Check for an existing lock from this pod, in case we were restarted.
        match self.store.get_config_map(&ns, lock_name).await {
            Ok(existing) => {
                let owners = existing.metadata.owner_references.unwrap_or_default();
                if owners.iter().any(|owner| me.matches(owner)) {
                    tracing::info!("found existing lock with my name, continuing as the leader");
                    self.set_state(ElectionState::Held);
                    return Ok(());
                }
                for owner in owners.iter() {
                    tracing::info!(owner = %owner.name, "found existing lock");
                }
            }
            Err(StoreError::NotFound) => {
                tracing::info!("no pre-existing lock was found");
                self.set_state(ElectionState::Uncontested);
            }
            Err(err) => return Err(ElectionError::store("fetching leader lock")(err)),
        }

        let lock = Self::build_lock(&ns, lock_name, &me);
        let mut backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff, self.config.jitter);
        let mut malformed = MalformedLockTracker::new(self.config.malformed_lock_warn_threshold);
        loop {
            match self.store.create_config_map(&ns, &lock).await {
                Ok(()) => {
                    tracing::info!("became the leader");
                    self.set_state(ElectionState::Held);
                    return Ok(());
                }
                Err(StoreError::AlreadyExists) => (),
                Err(err) => return Err(ElectionError::store("creating leader lock")(err)),
            }

            self.observe_holder(&ns, lock_name, &mut malformed).await?;

            self.set_state(ElectionState::Contending { backoff: backoff.current() });
            let delay = backoff.jittered();
            tracing::debug!(backoff = ?backoff.current(), delay = ?delay, "delaying before next attempt to acquire lock");
            tokio::select! {
                _ = tokio::time::sleep(delay) => (),
                _ = shutdown.recv() => {
                    tracing::info!("leader election cancelled while waiting for lock");
                    return Err(ElectionError::Cancelled);
                }
            }
            backoff.advance();
        }
    }

    /// Resolve the identity of this process from its own pod.
    async fn resolve_identity(&self, ns: &str) -> Result<ProcessIdentity, ElectionError> {
        let name = identity::pod_name(&self.config.identity)?;
        let pod = match self.store.get_pod(ns, &name).await {
            Ok(pod) => pod,
            Err(StoreError::NotFound) => return Err(ElectionError::Identity(format!("operator pod {} not found in namespace {}", name, ns))),
            Err(err) => return Err(ElectionError::store("fetching operator pod")(err)),
        };
        ProcessIdentity::from_pod(&pod)
    }

    /// Inspect the current holder of the lock, deleting the holder's pod if it was evicted.
    #[tracing::instrument(level = "debug", skip(self, malformed))]
    async fn observe_holder(&self, ns: &str, lock_name: &str, malformed: &mut MalformedLockTracker) -> Result<(), ElectionError> {
        let existing = match self.store.get_config_map(ns, lock_name).await {
            Ok(existing) => existing,
            Err(StoreError::NotFound) => {
                tracing::debug!("lock disappeared before it could be inspected");
                return Ok(());
            }
            Err(err) => return Err(ElectionError::store("fetching leader lock")(err)),
        };

        let owner = match Self::lock_owner(&existing) {
            Ok(owner) => {
                malformed.well_formed();
                owner
            }
            Err(problem) => {
                if malformed.malformed() {
                    tracing::warn!(
                        lock = %lock_name,
                        namespace = %ns,
                        observations = malformed.observations(),
                        "{}, the lock may need to be removed manually",
                        problem
                    );
                } else {
                    tracing::info!(lock = %lock_name, owners = ?existing.metadata.owner_references, "{}", problem);
                }
                return Ok(());
            }
        };

        let liveness = match self.store.get_pod(ns, &owner.name).await {
            Ok(pod) => HolderLiveness::of_owner(owner, &pod),
            Err(StoreError::NotFound) => HolderLiveness::Gone,
            Err(err) => return Err(ElectionError::store("fetching leader pod")(err)),
        };
        let holder = HolderInfo {
            name: owner.name.clone(),
            liveness,
        };
        match holder.liveness {
            HolderLiveness::Gone => {
                tracing::info!(leader = %holder.name, "leader pod has been deleted, waiting for garbage collection to remove the lock");
            }
            HolderLiveness::Evicted => {
                tracing::info!(leader = %holder.name, "operator pod with leader lock has been evicted, deleting evicted leader");
                // The pod may not be deleted immediately, so continue with backoff regardless.
                if let Err(err) = self.store.delete_pod(ns, &holder.name).await {
                    tracing::error!(error = %err, leader = %holder.name, "leader pod could not be deleted");
                }
            }
            HolderLiveness::Terminating | HolderLiveness::Healthy => {
                tracing::info!(leader = %holder.name, "not the leader, waiting");
            }
        }
        Ok(())
    }

    /// Extract the single pod owner of the given lock.
    fn lock_owner(lock: &ConfigMap) -> Result<&OwnerReference, &'static str> {
        match lock.metadata.owner_references.as_deref().unwrap_or_default() {
            [owner] if owner.kind == OWNER_KIND => Ok(owner),
            [_] => Err("leader lock configmap owner reference must be a pod"),
            _ => Err("leader lock configmap must have exactly one owner reference"),
        }
    }

    /// Build the lock object to be created on behalf of this process.
    fn build_lock(ns: &str, lock_name: &str, me: &ProcessIdentity) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(lock_name.into()),
                namespace: Some(ns.into()),
                owner_references: Some(vec![me.owner_reference()]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Set the current election state & emit a state update.
    fn set_state(&self, state: ElectionState) {
        let is_leader = if matches!(state, ElectionState::Held) { 1.0 } else { 0.0 };
        metrics::gauge!(METRIC_IS_LEADER, is_leader);
        self.state_tx.send_replace(state);
    }
}

/// A count of consecutive malformed lock observations.
#[derive(Debug)]
pub(crate) struct MalformedLockTracker {
    observations: u32,
    threshold: u32,
}

impl MalformedLockTracker {
    /// Create a new instance which escalates from the given number of observations onward.
    pub(crate) fn new(threshold: u32) -> Self {
        Self { observations: 0, threshold }
    }

    /// Record a malformed observation, returning `true` if it should be reported as a warning.
    pub(crate) fn malformed(&mut self) -> bool {
        self.observations = self.observations.saturating_add(1);
        self.observations >= self.threshold
    }

    /// Record a well-formed observation, resetting the count.
    pub(crate) fn well_formed(&mut self) {
        self.observations = 0;
    }

    /// The number of consecutive malformed observations.
    pub(crate) fn observations(&self) -> u32 {
        self.observations
    }
}
