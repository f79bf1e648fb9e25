//! `ObjectStore` backed by the Kubernetes API server.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource};
use tracing::debug;

use super::{ObjectStore, StoreObject, object_name};
use crate::error::StoreError;

/// Store that reads and writes through `kube::Api`.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub const fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K: StoreObject>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Translate an API error for `kind namespace/name`, mapping 404 and 409.
fn map_err<K: StoreObject>(
    err: kube::Error,
    namespace: &str,
    name: &str,
    on_conflict: fn(String, String, String) -> StoreError,
) -> StoreError {
    let kind = K::kind(&()).to_string();
    match err {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(ae) if ae.code == 409 => {
            on_conflict(kind, namespace.to_string(), name.to_string())
        }
        other => StoreError::Api(other.to_string()),
    }
}

fn conflict(kind: String, namespace: String, name: String) -> StoreError {
    StoreError::Conflict {
        kind,
        namespace,
        name,
    }
}

fn already_exists(kind: String, namespace: String, name: String) -> StoreError {
    StoreError::AlreadyExists {
        kind,
        namespace,
        name,
    }
}

fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: StoreObject>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<K>, StoreError> {
        self.api::<K>(namespace)
            .get_opt(name)
            .await
            .map_err(|e| map_err::<K>(e, namespace, name, conflict))
    }

    async fn list<K: StoreObject>(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>, StoreError> {
        let mut lp = ListParams::default();
        if !labels.is_empty() {
            lp = lp.labels(&label_selector(labels));
        }
        let list = self
            .api::<K>(namespace)
            .list(&lp)
            .await
            .map_err(|e| StoreError::Api(e.to_string()))?;
        Ok(list.items)
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError> {
        let (namespace, name) = object_name(obj);
        debug!("Creating {} {}/{}", K::kind(&()), namespace, name);
        self.api::<K>(&namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| map_err::<K>(e, &namespace, &name, already_exists))
    }

    async fn replace<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError> {
        let (namespace, name) = object_name(obj);
        self.api::<K>(&namespace)
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| map_err::<K>(e, &namespace, &name, conflict))
    }

    async fn replace_status<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError> {
        let (namespace, name) = object_name(obj);
        let value = serde_json::to_value(obj)?;
        // resourceVersion in a merge patch turns it into a precondition
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": obj.meta().resource_version },
            "status": value.get("status").cloned().unwrap_or(serde_json::Value::Null),
        });
        self.api::<K>(&namespace)
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_err::<K>(e, &namespace, &name, conflict))
    }

    async fn delete<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.api::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_err::<K>(e, namespace, name, conflict))
    }
}
