use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};

use crate::error::{StoreError, StoreResult};
use crate::k8s::identity::{OWNER_API_VERSION, OWNER_KIND};
use crate::k8s::ObjectStore;

/// The namespace used by test fixtures.
pub const NAMESPACE: &str = "openshift-network-operator";
/// The lock name used by test fixtures.
pub const LOCK: &str = "network-operator-lock";

/// An operation performed against a `FakeStore`.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Op {
    GetConfigMap,
    CreateConfigMap,
    GetPod,
    DeletePod,
}

/// A recorded call against a `FakeStore`, with the name of the target object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub op: Op,
    pub name: String,
}

#[derive(Default)]
struct Inner {
    config_maps: BTreeMap<(String, String), ConfigMap>,
    pods: BTreeMap<(String, String), Pod>,
    calls: Vec<Call>,
    failing: HashSet<Op>,
    failing_named: HashSet<(Op, String)>,
    gc_on_pod_delete: bool,
    gc_on_create_conflict: bool,
}

/// An in-memory object store which enforces create-if-absent semantics.
#[derive(Clone, Default)]
pub struct FakeStore {
    inner: Arc<Mutex<Inner>>,
}

impl FakeStore {
    /// Add or replace a pod in the store.
    pub fn insert_pod(&self, pod: Pod) {
        let mut inner = self.inner.lock().unwrap();
        let key = (pod.metadata.namespace.clone().unwrap_or_default(), pod.metadata.name.clone().unwrap_or_default());
        inner.pods.insert(key, pod);
    }

    /// Add or replace a ConfigMap in the store.
    pub fn insert_config_map(&self, cm: ConfigMap) {
        let mut inner = self.inner.lock().unwrap();
        let key = (cm.metadata.namespace.clone().unwrap_or_default(), cm.metadata.name.clone().unwrap_or_default());
        inner.config_maps.insert(key, cm);
    }

    /// Remove a ConfigMap from the store, as the garbage collector would.
    pub fn collect_config_map(&self, namespace: &str, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.config_maps.remove(&key(namespace, name));
    }

    /// Get a copy of the named ConfigMap, if present.
    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        let inner = self.inner.lock().unwrap();
        inner.config_maps.get(&key(namespace, name)).cloned()
    }

    /// Check if the named pod is present.
    pub fn has_pod(&self, namespace: &str, name: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.pods.contains_key(&key(namespace, name))
    }

    /// Make every call of the given operation fail with an opaque error.
    pub fn fail(&self, op: Op) {
        self.inner.lock().unwrap().failing.insert(op);
    }

    /// Make every call of the given operation against the named object fail with an opaque error.
    pub fn fail_named(&self, op: Op, name: &str) {
        self.inner.lock().unwrap().failing_named.insert((op, name.into()));
    }

    /// Remove a ConfigMap right after a create conflicts with it, as if it were collected in between.
    pub fn collect_on_create_conflict(&self) {
        self.inner.lock().unwrap().gc_on_create_conflict = true;
    }

    /// Cascade pod deletion to the ConfigMaps which the pod owns.
    pub fn collect_on_pod_delete(&self) {
        self.inner.lock().unwrap().gc_on_pod_delete = true;
    }

    /// All calls made against this store so far.
    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// The number of calls of the given operation made so far.
    pub fn count(&self, op: Op) -> usize {
        self.inner.lock().unwrap().calls.iter().filter(|call| call.op == op).count()
    }

    fn record(&self, op: Op, name: &str) -> StoreResult<std::sync::MutexGuard<'_, Inner>> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call { op, name: name.into() });
        if inner.failing.contains(&op) || inner.failing_named.contains(&(op, name.to_string())) {
            return Err(StoreError::Other(anyhow!("injected {:?} failure", op)));
        }
        Ok(inner)
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn get_config_map(&self, namespace: &str, name: &str) -> StoreResult<ConfigMap> {
        let inner = self.record(Op::GetConfigMap, name)?;
        inner.config_maps.get(&key(namespace, name)).cloned().ok_or(StoreError::NotFound)
    }

    async fn create_config_map(&self, namespace: &str, cm: &ConfigMap) -> StoreResult<()> {
        let name = cm.metadata.name.clone().unwrap_or_default();
        let mut inner = self.record(Op::CreateConfigMap, &name)?;
        let key = key(namespace, &name);
        if inner.config_maps.contains_key(&key) {
            if inner.gc_on_create_conflict {
                inner.config_maps.remove(&key);
            }
            return Err(StoreError::AlreadyExists);
        }
        inner.config_maps.insert(key, cm.clone());
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> StoreResult<Pod> {
        let inner = self.record(Op::GetPod, name)?;
        inner.pods.get(&key(namespace, name)).cloned().ok_or(StoreError::NotFound)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> StoreResult<()> {
        let mut inner = self.record(Op::DeletePod, name)?;
        let pod = inner.pods.remove(&key(namespace, name)).ok_or(StoreError::NotFound)?;
        if inner.gc_on_pod_delete {
            let uid = pod.metadata.uid.unwrap_or_default();
            inner
                .config_maps
                .retain(|_, cm| !cm.metadata.owner_references.iter().flatten().any(|owner| owner.uid == uid));
        }
        Ok(())
    }
}

fn key(namespace: &str, name: &str) -> (String, String) {
    (namespace.to_string(), name.to_string())
}

/// Build a running pod.
pub fn pod(name: &str, uid: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(NAMESPACE.into()),
            uid: Some(uid.into()),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some("Running".into()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build a pod which has been evicted from its node.
pub fn evicted_pod(name: &str, uid: &str) -> Pod {
    let mut pod = pod(name, uid);
    pod.status = Some(PodStatus {
        phase: Some("Failed".into()),
        reason: Some("Evicted".into()),
        ..Default::default()
    });
    pod
}

/// Build an evicted pod which is already marked for deletion.
pub fn terminating_evicted_pod(name: &str, uid: &str) -> Pod {
    let mut pod = evicted_pod(name, uid);
    pod.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
    pod
}

/// Build an owner reference pointing at the given pod.
pub fn owner_ref(pod: &Pod) -> OwnerReference {
    OwnerReference {
        api_version: OWNER_API_VERSION.into(),
        kind: OWNER_KIND.into(),
        name: pod.metadata.name.clone().unwrap_or_default(),
        uid: pod.metadata.uid.clone().unwrap_or_default(),
        ..Default::default()
    }
}

/// Build a lock ConfigMap with the given owner references.
pub fn lock(owners: Vec<OwnerReference>) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(LOCK.into()),
            namespace: Some(NAMESPACE.into()),
            owner_references: Some(owners),
            ..Default::default()
        },
        ..Default::default()
    }
}
