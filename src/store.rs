//! Typed access to the shared object store.
//!
//! Reconcilers only talk to the store through [`ObjectStore`], so the same
//! code runs against the Kubernetes API (`KubeStore`) and the in-memory
//! store used by tests.

pub mod kube_api;
#[cfg(test)]
pub mod memory;

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StoreError;

pub use kube_api::KubeStore;

/// Any namespaced resource the store can hold.
pub trait StoreObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> StoreObject for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// get/list/create/replace/delete with optimistic concurrency.
///
/// `replace` writes metadata and spec, `replace_status` writes only the
/// status. Both fail with `Conflict` when the object's `resourceVersion` is
/// stale. `delete` of an object that still carries finalizers only sets its
/// deletion timestamp.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str)
    -> Result<Option<K>, StoreError>;

    /// List objects in `namespace` whose labels contain all of `labels`.
    async fn list<K: StoreObject>(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>, StoreError>;

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError>;

    async fn replace<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError>;

    async fn replace_status<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError>;

    async fn delete<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}

/// Label selector matching everything owned by `cluster`.
pub fn cluster_labels(cluster: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(
        crate::crd::CLUSTER_NAME_LABEL.to_string(),
        cluster.to_string(),
    )])
}

/// Name of the owner of `obj` with the given kind, if any.
pub fn owner_name<K: Resource>(obj: &K, kind: &str) -> Option<String> {
    obj.meta()
        .owner_references
        .as_ref()?
        .iter()
        .find(|o| o.kind == kind)
        .map(|o| o.name.clone())
}

/// Whether `obj` is owned by an object of `kind` named `name`.
pub fn is_owned_by<K: Resource>(obj: &K, kind: &str, name: &str) -> bool {
    owner_name(obj, kind).as_deref() == Some(name)
}

pub(crate) fn object_name<K: Resource>(obj: &K) -> (String, String) {
    let meta = obj.meta();
    (
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}
