//! Kubernetes integration.
//!
//! The leader election protocol only ever needs a handful of namespaced operations on two
//! kinds of objects: the ConfigMap used as the lock, and the Pods which own such locks. These
//! operations are captured by the `ObjectStore` trait, which is implemented for the live cluster
//! by `KubeStore`.

mod backoff;
pub mod identity;
pub mod leader;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::{Api, DeleteParams, PostParams};
use kube::client::Client;

use crate::error::StoreResult;

pub use leader::{ElectionState, LeaderElector};

/// A namespaced object store with optimistic create/get/delete semantics.
///
/// Implementations must guarantee that `create_config_map` is atomic create-if-absent, as it
/// is the sole source of mutual exclusion for leader election.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Fetch the named ConfigMap.
    async fn get_config_map(&self, namespace: &str, name: &str) -> StoreResult<ConfigMap>;
    /// Create the given ConfigMap, failing with `AlreadyExists` if it is already present.
    async fn create_config_map(&self, namespace: &str, cm: &ConfigMap) -> StoreResult<()>;
    /// Fetch the named Pod.
    async fn get_pod(&self, namespace: &str, name: &str) -> StoreResult<Pod>;
    /// Delete the named Pod.
    async fn delete_pod(&self, namespace: &str, name: &str) -> StoreResult<()>;
}

/// An `ObjectStore` backed by the K8s API.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Create a new instance.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get_config_map(&self, namespace: &str, name: &str) -> StoreResult<ConfigMap> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn create_config_map(&self, namespace: &str, cm: &ConfigMap) -> StoreResult<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), cm).await?;
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> StoreResult<Pod> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> StoreResult<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}
