//! Cluster-scoped mutex stored as a `ConfigMap`.
//!
//! The record `<cluster>-lock` holds `{"holderID": "<instance>"}` under the
//! `lock-information` key. Creating it acquires the lock and deleting it
//! releases it. Both operations are single-shot: callers that fail to
//! acquire requeue instead of waiting.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::crd::{CLUSTER_NAME_LABEL, Cluster, Instance, Machine};
use crate::store::{ObjectStore, owner_name};
use crate::telemetry::metrics::Metrics;

/// Data key holding the serialized [`LockInformation`].
pub const LOCK_INFORMATION_KEY: &str = "lock-information";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LockInformation {
    #[serde(rename = "holderID")]
    pub holder_id: String,
}

pub fn lock_name(cluster: &str) -> String {
    format!("{cluster}-lock")
}

/// Outcome of a lock attempt, recorded in metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockOutcome {
    Acquired,
    Reentered,
    Contended,
    Fenced,
    Error,
}

impl LockOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Acquired => "acquired",
            Self::Reentered => "reentered",
            Self::Contended => "contended",
            Self::Fenced => "fenced",
            Self::Error => "error",
        }
    }

    const fn held(self) -> bool {
        matches!(self, Self::Acquired | Self::Reentered)
    }
}

/// Lock handle for one store.
pub struct ClusterLock<'a, S> {
    store: &'a S,
    metrics: Option<&'a Metrics>,
}

impl<'a, S: ObjectStore> ClusterLock<'a, S> {
    pub const fn new(store: &'a S) -> Self {
        Self {
            store,
            metrics: None,
        }
    }

    pub const fn with_metrics(mut self, metrics: &'a Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Try to take the lock for `cluster` on behalf of `holder`.
    ///
    /// Returns true if `holder` now holds the lock, including when it
    /// already did. When the current holder no longer exists the stale
    /// record is removed and false is returned so the caller retries.
    pub async fn lock(&self, cluster: &Cluster, holder: &str) -> bool {
        let outcome = self.try_lock(cluster, holder).await;
        if let Some(metrics) = self.metrics {
            metrics.record_lock(outcome.as_str());
        }
        outcome.held()
    }

    async fn try_lock(&self, cluster: &Cluster, holder: &str) -> LockOutcome {
        let namespace = cluster.metadata.namespace.as_deref().unwrap_or("default");
        let cluster_name = cluster.metadata.name.as_deref().unwrap_or_default();
        let name = lock_name(cluster_name);

        match self.store.get::<ConfigMap>(namespace, &name).await {
            Ok(Some(existing)) => {
                return self
                    .check_existing(cluster, namespace, &existing, holder)
                    .await;
            }
            Ok(None) => {}
            Err(e) => {
                error!("Failed to read lock {}/{}: {}", namespace, name, e);
                return LockOutcome::Error;
            }
        }

        let record = match lock_record(cluster, holder) {
            Ok(r) => r,
            Err(e) => {
                error!("Failed to encode lock information for {}: {}", holder, e);
                return LockOutcome::Error;
            }
        };

        info!(cluster = cluster_name, holder, "Attempting to acquire the lock");
        match self.store.create(&record).await {
            Ok(_) => LockOutcome::Acquired,
            Err(e) if e.is_already_exists() => {
                info!(
                    cluster = cluster_name,
                    "Cannot acquire the lock, it was acquired by someone else"
                );
                LockOutcome::Contended
            }
            Err(e) => {
                error!("Error acquiring lock {}/{}: {}", namespace, name, e);
                LockOutcome::Error
            }
        }
    }

    async fn check_existing(
        &self,
        cluster: &Cluster,
        namespace: &str,
        existing: &ConfigMap,
        holder: &str,
    ) -> LockOutcome {
        let Some(info) = lock_information(existing) else {
            warn!(
                "Lock {} has no readable holder information",
                existing.metadata.name.as_deref().unwrap_or_default()
            );
            return LockOutcome::Contended;
        };

        if info.holder_id == holder {
            return LockOutcome::Reentered;
        }

        match self.holder_alive(namespace, &info.holder_id).await {
            Ok(true) => {
                info!("Waiting for {} to release the lock", info.holder_id);
                LockOutcome::Contended
            }
            Ok(false) => {
                warn!(
                    "Lock holder {} no longer exists, releasing its lock",
                    info.holder_id
                );
                self.unlock(cluster).await;
                LockOutcome::Fenced
            }
            Err(e) => {
                error!("Failed to check lock holder {}: {}", info.holder_id, e);
                LockOutcome::Error
            }
        }
    }

    /// Whether the machine owning `holder` still exists.
    async fn holder_alive(
        &self,
        namespace: &str,
        holder: &str,
    ) -> Result<bool, crate::error::StoreError> {
        let machine_name = match self.store.get::<Instance>(namespace, holder).await? {
            Some(instance) => {
                owner_name(&instance, "Machine").unwrap_or_else(|| holder.to_string())
            }
            None => return Ok(false),
        };
        Ok(self
            .store
            .get::<Machine>(namespace, &machine_name)
            .await?
            .is_some())
    }

    /// Release the lock for `cluster`. Returns false only when the record
    /// exists and could not be deleted.
    pub async fn unlock(&self, cluster: &Cluster) -> bool {
        let namespace = cluster.metadata.namespace.as_deref().unwrap_or("default");
        let name = lock_name(cluster.metadata.name.as_deref().unwrap_or_default());
        match self.store.delete::<ConfigMap>(namespace, &name).await {
            Ok(()) => true,
            Err(e) if e.is_not_found() => true,
            Err(e) => {
                error!("Error deleting lock {}/{}: {}", namespace, name, e);
                false
            }
        }
    }

    /// Current holder of the lock for `cluster`, if any.
    pub async fn holder(&self, cluster: &Cluster) -> Option<String> {
        let namespace = cluster.metadata.namespace.as_deref().unwrap_or("default");
        let name = lock_name(cluster.metadata.name.as_deref().unwrap_or_default());
        let cm = self
            .store
            .get::<ConfigMap>(namespace, &name)
            .await
            .ok()
            .flatten()?;
        lock_information(&cm).map(|i| i.holder_id)
    }
}

fn lock_information(cm: &ConfigMap) -> Option<LockInformation> {
    let raw = cm.data.as_ref()?.get(LOCK_INFORMATION_KEY)?;
    serde_json::from_str(raw).ok()
}

fn lock_record(cluster: &Cluster, holder: &str) -> Result<ConfigMap, serde_json::Error> {
    let cluster_name = cluster.metadata.name.clone().unwrap_or_default();
    let info = serde_json::to_string(&LockInformation {
        holder_id: holder.to_string(),
    })?;
    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(lock_name(&cluster_name)),
            namespace: cluster.metadata.namespace.clone(),
            labels: Some(BTreeMap::from([(
                CLUSTER_NAME_LABEL.to_string(),
                cluster_name.clone(),
            )])),
            owner_references: Some(vec![OwnerReference {
                api_version: "sko.io/v1alpha1".to_string(),
                kind: "Cluster".to_string(),
                name: cluster_name,
                uid: cluster.metadata.uid.clone().unwrap_or_default(),
                ..OwnerReference::default()
            }]),
            ..ObjectMeta::default()
        },
        data: Some(BTreeMap::from([(LOCK_INFORMATION_KEY.to_string(), info)])),
        ..ConfigMap::default()
    })
}
