//! In-memory `ObjectStore` for tests.
//!
//! Mirrors the API server behaviors the reconcilers depend on:
//! `resourceVersion` conflicts, already-exists on create, status written
//! separately from metadata and spec, and finalizer-gated deletion.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;

use super::{ObjectStore, StoreObject, object_name};
use crate::error::StoreError;

type Key = (String, String, String);

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<Key, Value>>,
    version: AtomicU64,
    /// Objects whose next `replace` fails with a conflict.
    conflicts: Mutex<BTreeSet<Key>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn key<K: StoreObject>(namespace: &str, name: &str) -> Key {
        (
            K::kind(&()).to_string(),
            namespace.to_string(),
            name.to_string(),
        )
    }

    fn not_found<K: StoreObject>(namespace: &str, name: &str) -> StoreError {
        StoreError::NotFound {
            kind: K::kind(&()).to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn conflict<K: StoreObject>(namespace: &str, name: &str) -> StoreError {
        StoreError::Conflict {
            kind: K::kind(&()).to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Number of stored objects of kind `K`.
    pub fn count<K: StoreObject>(&self) -> usize {
        let kind = K::kind(&()).to_string();
        self.objects
            .lock()
            .unwrap()
            .keys()
            .filter(|(k, _, _)| *k == kind)
            .count()
    }

    /// Make the next `replace` of the named object fail with a conflict, as
    /// if another writer got there first.
    pub fn conflict_next_replace<K: StoreObject>(&self, namespace: &str, name: &str) {
        self.conflicts
            .lock()
            .unwrap()
            .insert(Self::key::<K>(namespace, name));
    }

    /// Insert or overwrite without version checks, for test fixtures.
    pub fn seed<K: StoreObject>(&self, obj: &K) {
        let (namespace, name) = object_name(obj);
        let mut value = serde_json::to_value(obj).unwrap();
        value["metadata"]["resourceVersion"] = Value::String(self.next_version());
        if value["metadata"].get("uid").is_none() {
            value["metadata"]["uid"] = Value::String(format!("uid-{namespace}-{name}"));
        }
        self.objects
            .lock()
            .unwrap()
            .insert(Self::key::<K>(&namespace, &name), value);
    }
}

fn labels_match(value: &Value, selector: &BTreeMap<String, String>) -> bool {
    let labels = &value["metadata"]["labels"];
    selector
        .iter()
        .all(|(k, v)| labels.get(k).and_then(Value::as_str) == Some(v.as_str()))
}

fn has_finalizers(value: &Value) -> bool {
    value["metadata"]["finalizers"]
        .as_array()
        .is_some_and(|f| !f.is_empty())
}

fn is_deleting(value: &Value) -> bool {
    !value["metadata"]["deletionTimestamp"].is_null()
}

fn status_of(value: &Value) -> Value {
    value.get("status").cloned().unwrap_or(Value::Null)
}

fn set_status(value: &mut Value, status: Value) {
    if let Some(map) = value.as_object_mut() {
        if status.is_null() {
            map.remove("status");
        } else {
            map.insert("status".to_string(), status);
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get<K: StoreObject>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<K>, StoreError> {
        let value = self
            .objects
            .lock()
            .unwrap()
            .get(&Self::key::<K>(namespace, name))
            .cloned();
        match value {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    async fn list<K: StoreObject>(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>, StoreError> {
        let kind = K::kind(&()).to_string();
        let values: Vec<Value> = self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|((k, ns, _), v)| *k == kind && ns == namespace && labels_match(v, labels))
            .map(|(_, v)| v.clone())
            .collect();
        values
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(StoreError::from))
            .collect()
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError> {
        let (namespace, name) = object_name(obj);
        let key = Self::key::<K>(&namespace, &name);
        let mut value = serde_json::to_value(obj)?;
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: key.0,
                namespace,
                name,
            });
        }
        value["metadata"]["resourceVersion"] = Value::String(self.next_version());
        value["metadata"]["uid"] = Value::String(format!("uid-{namespace}-{name}"));
        objects.insert(key, value.clone());
        drop(objects);
        Ok(serde_json::from_value(value)?)
    }

    async fn replace<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError> {
        let (namespace, name) = object_name(obj);
        let key = Self::key::<K>(&namespace, &name);
        let mut value = serde_json::to_value(obj)?;
        let mut objects = self.objects.lock().unwrap();
        let Some(stored) = objects.get(&key) else {
            return Err(Self::not_found::<K>(&namespace, &name));
        };
        if self.conflicts.lock().unwrap().remove(&key) {
            return Err(Self::conflict::<K>(&namespace, &name));
        }
        if let Some(rv) = obj.meta().resource_version.as_deref()
            && stored["metadata"]["resourceVersion"].as_str() != Some(rv)
        {
            return Err(Self::conflict::<K>(&namespace, &name));
        }
        // Status and deletion timestamp are owned by the server side.
        set_status(&mut value, status_of(stored));
        value["metadata"]["deletionTimestamp"] = stored["metadata"]["deletionTimestamp"].clone();
        value["metadata"]["uid"] = stored["metadata"]["uid"].clone();
        value["metadata"]["resourceVersion"] = Value::String(self.next_version());
        if is_deleting(&value) && !has_finalizers(&value) {
            objects.remove(&key);
        } else {
            objects.insert(key, value.clone());
        }
        drop(objects);
        Ok(serde_json::from_value(value)?)
    }

    async fn replace_status<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError> {
        let (namespace, name) = object_name(obj);
        let key = Self::key::<K>(&namespace, &name);
        let incoming = serde_json::to_value(obj)?;
        let mut objects = self.objects.lock().unwrap();
        let Some(stored) = objects.get_mut(&key) else {
            return Err(Self::not_found::<K>(&namespace, &name));
        };
        if let Some(rv) = obj.meta().resource_version.as_deref()
            && stored["metadata"]["resourceVersion"].as_str() != Some(rv)
        {
            return Err(Self::conflict::<K>(&namespace, &name));
        }
        set_status(stored, status_of(&incoming));
        stored["metadata"]["resourceVersion"] = Value::String(self.next_version());
        let value = stored.clone();
        drop(objects);
        Ok(serde_json::from_value(value)?)
    }

    async fn delete<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let key = Self::key::<K>(namespace, name);
        let mut objects = self.objects.lock().unwrap();
        let Some(stored) = objects.get_mut(&key) else {
            return Err(Self::not_found::<K>(namespace, name));
        };
        if has_finalizers(stored) {
            if !is_deleting(stored) {
                stored["metadata"]["deletionTimestamp"] = Value::String(
                    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                );
                stored["metadata"]["resourceVersion"] = Value::String(self.next_version());
            }
        } else {
            objects.remove(&key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    fn config_map(name: &str, labels: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                        .collect(),
                ),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        }
    }

    #[tokio::test]
    async fn test_create_twice_is_already_exists() {
        let store = MemoryStore::new();
        store.create(&config_map("a", &[])).await.unwrap();
        let err = store.create(&config_map("a", &[])).await.unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(store.count::<ConfigMap>(), 1);
    }

    #[tokio::test]
    async fn test_stale_replace_conflicts() {
        let store = MemoryStore::new();
        let created = store.create(&config_map("a", &[])).await.unwrap();
        let mut first = created.clone();
        first.data = Some([("k".to_string(), "1".to_string())].into());
        store.replace(&first).await.unwrap();

        let mut stale = created;
        stale.data = Some([("k".to_string(), "2".to_string())].into());
        let err = store.replace(&stale).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_list_filters_by_labels() {
        let store = MemoryStore::new();
        store.create(&config_map("a", &[("c", "demo")])).await.unwrap();
        store.create(&config_map("b", &[("c", "other")])).await.unwrap();
        let found: Vec<ConfigMap> = store
            .list("default", &BTreeMap::from([("c".to_string(), "demo".to_string())]))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].metadata.name.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_delete_with_finalizer_sets_timestamp() {
        let store = MemoryStore::new();
        let mut cm = config_map("a", &[]);
        cm.metadata.finalizers = Some(vec!["test".to_string()]);
        store.create(&cm).await.unwrap();

        store.delete::<ConfigMap>("default", "a").await.unwrap();
        let mut held: ConfigMap = store.get("default", "a").await.unwrap().unwrap();
        assert!(held.metadata.deletion_timestamp.is_some());

        held.metadata.finalizers = Some(vec![]);
        store.replace(&held).await.unwrap();
        let gone: Option<ConfigMap> = store.get("default", "a").await.unwrap();
        assert!(gone.is_none());
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .delete::<ConfigMap>("default", "missing")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
