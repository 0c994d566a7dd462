//! Kubernetes object access used by the reconciler and actuators.
//!
//! Everything goes through the [`ResourceClient`] trait so the reconcile path
//! can be unit tested against an in-memory store.

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;

/// Namespace and name of an object. Cluster scoped objects have no namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace, `None` for cluster scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key of a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key of a cluster scoped object
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Key of an existing object
    pub fn from_resource<K: Resource>(obj: &K) -> Self {
        let meta = obj.meta();
        Self {
            namespace: meta.namespace.clone(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Returns true if the error is an HTTP 404 from the API server.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 404)
}

/// Returns true if the error is an HTTP 409 (conflict or already exists).
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 409)
}

/// Read and write access to objects of one kind.
#[async_trait]
pub trait ResourceClient<K>: Send + Sync {
    /// Get an object, `None` if it does not exist
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>, kube::Error>;

    /// List objects matching a label selector, in one namespace or in all
    async fn list(&self, namespace: Option<&str>, label_selector: &str) -> Result<Vec<K>, kube::Error>;

    /// Create an object
    async fn create(&self, obj: &K) -> Result<K, kube::Error>;

    /// Delete an object. A missing object is reported as a 404 error.
    async fn delete(&self, key: &ObjectKey) -> Result<(), kube::Error>;

    /// Apply a JSON merge patch to an object
    async fn patch(&self, key: &ObjectKey, patch: &Value) -> Result<K, kube::Error>;

    /// Apply a JSON merge patch to the status subresource of an object
    async fn patch_status(&self, key: &ObjectKey, patch: &Value) -> Result<K, kube::Error>;
}

/// [`ResourceClient`] backed by the Kubernetes API.
pub struct KubeResourceClient<K> {
    client: Client,
    api: fn(Client, Option<&str>) -> Api<K>,
}

impl<K> fmt::Debug for KubeResourceClient<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeResourceClient").finish_non_exhaustive()
    }
}

impl<K> KubeResourceClient<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    /// Client for a namespaced kind. Lists without a namespace span all namespaces.
    pub fn namespaced(client: Client) -> Self {
        Self {
            client,
            api: |client: Client, namespace: Option<&str>| match namespace {
                Some(ns) => Api::namespaced(client, ns),
                None => Api::all(client),
            },
        }
    }
}

impl<K> KubeResourceClient<K>
where
    K: Resource<Scope = ClusterResourceScope, DynamicType = ()>,
{
    /// Client for a cluster scoped kind
    pub fn cluster(client: Client) -> Self {
        Self {
            client,
            api: |client: Client, _namespace: Option<&str>| Api::all(client),
        }
    }
}

impl<K> KubeResourceClient<K> {
    fn api(&self, namespace: Option<&str>) -> Api<K> {
        (self.api)(self.client.clone(), namespace)
    }
}

#[async_trait]
impl<K> ResourceClient<K> for KubeResourceClient<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + fmt::Debug + Send + Sync + 'static,
{
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>, kube::Error> {
        self.api(key.namespace.as_deref()).get_opt(&key.name).await
    }

    async fn list(&self, namespace: Option<&str>, label_selector: &str) -> Result<Vec<K>, kube::Error> {
        let mut params = ListParams::default();
        if !label_selector.is_empty() {
            params = params.labels(label_selector);
        }
        Ok(self.api(namespace).list(&params).await?.items)
    }

    async fn create(&self, obj: &K) -> Result<K, kube::Error> {
        self.api(obj.meta().namespace.as_deref())
            .create(&PostParams::default(), obj)
            .await
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), kube::Error> {
        self.api(key.namespace.as_deref())
            .delete(&key.name, &DeleteParams::default())
            .await
            .map(|_| ())
    }

    async fn patch(&self, key: &ObjectKey, patch: &Value) -> Result<K, kube::Error> {
        self.api(key.namespace.as_deref())
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
    }

    async fn patch_status(&self, key: &ObjectKey, patch: &Value) -> Result<K, kube::Error> {
        self.api(key.namespace.as_deref())
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
    }
}
