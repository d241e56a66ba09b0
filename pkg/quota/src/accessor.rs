use chrono::Utc;
use pkg_constants::state::{NAMESPACES_PREFIX, SHARED_QUOTAS_PREFIX};
use pkg_state::client::{CasEntry, StateStore};
use pkg_types::namespace::Namespace;
use pkg_types::quota::{SharedQuota, SharedQuotaSpec, SharedQuotaStatus};
use tracing::debug;
use uuid::Uuid;

use crate::{QuotaError, Result};

pub fn quota_key(name: &str) -> String {
    format!("{}{}", SHARED_QUOTAS_PREFIX, name)
}

pub fn namespace_key(name: &str) -> String {
    format!("{}{}", NAMESPACES_PREFIX, name)
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| QuotaError::Store(e.into()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| QuotaError::Store(e.into()))
}

/// Typed access to shared quotas and the namespaces they select.
///
/// Every write is a compare-and-swap against the stored bytes, and bumps
/// `resource_version`. A caller holding a stale copy gets
/// [`QuotaError::Conflict`] and must re-read.
#[derive(Clone)]
pub struct SharedQuotaClient {
    store: StateStore,
}

impl SharedQuotaClient {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    async fn get_raw(&self, name: &str) -> Result<Option<(SharedQuota, Vec<u8>)>> {
        match self.store.get(&quota_key(name)).await? {
            Some(bytes) => Ok(Some((decode(&bytes)?, bytes))),
            None => Ok(None),
        }
    }

    pub async fn get(&self, name: &str) -> Result<Option<SharedQuota>> {
        Ok(self.get_raw(name).await?.map(|(quota, _)| quota))
    }

    pub async fn list(&self) -> Result<Vec<SharedQuota>> {
        let entries = self.store.list_prefix(SHARED_QUOTAS_PREFIX).await?;
        entries.iter().map(|(_, v)| decode(v)).collect()
    }

    /// Store a new quota with a fresh uid and empty status.
    pub async fn create(&self, name: &str, spec: SharedQuotaSpec) -> Result<SharedQuota> {
        let quota = SharedQuota {
            name: name.to_string(),
            uid: Uuid::new_v4().to_string(),
            resource_version: 1,
            spec,
            status: SharedQuotaStatus::default(),
            created_at: Utc::now(),
        };
        let written = self
            .store
            .compare_and_put(&[CasEntry {
                key: quota_key(name),
                expected: None,
                value: encode(&quota)?,
            }])
            .await?;
        if !written {
            return Err(QuotaError::Conflict(name.to_string()));
        }
        Ok(quota)
    }

    /// Replace the spec, leaving status alone.
    pub async fn update_spec(&self, name: &str, spec: SharedQuotaSpec) -> Result<SharedQuota> {
        let (current, raw) = self
            .get_raw(name)
            .await?
            .ok_or_else(|| QuotaError::NotFound(name.to_string()))?;
        let updated = SharedQuota {
            spec,
            resource_version: current.resource_version + 1,
            ..current
        };
        self.swap(&[(raw, updated.clone())]).await?;
        Ok(updated)
    }

    pub async fn delete(&self, name: &str) -> Result<bool> {
        let key = quota_key(name);
        if self.store.get(&key).await?.is_none() {
            return Ok(false);
        }
        self.store.delete(&key).await?;
        Ok(true)
    }

    /// Write `quota.status` if the stored quota is still at
    /// `quota.resource_version`.
    pub async fn update_status(&self, quota: &SharedQuota) -> Result<SharedQuota> {
        let mut written = self.update_statuses(std::slice::from_ref(quota)).await?;
        written
            .pop()
            .ok_or_else(|| QuotaError::NotFound(quota.name.clone()))
    }

    /// Write the status of every quota in one atomic batch. Nothing is
    /// written if any of them has moved past the version the caller read.
    pub async fn update_statuses(&self, quotas: &[SharedQuota]) -> Result<Vec<SharedQuota>> {
        let mut swaps = Vec::with_capacity(quotas.len());
        for quota in quotas {
            let (current, raw) = self
                .get_raw(&quota.name)
                .await?
                .ok_or_else(|| QuotaError::NotFound(quota.name.clone()))?;
            if current.resource_version != quota.resource_version {
                return Err(QuotaError::Conflict(quota.name.clone()));
            }
            let updated = SharedQuota {
                status: quota.status.clone(),
                resource_version: current.resource_version + 1,
                ..current
            };
            swaps.push((raw, updated));
        }
        self.swap(&swaps).await?;
        Ok(swaps.into_iter().map(|(_, quota)| quota).collect())
    }

    async fn swap(&self, swaps: &[(Vec<u8>, SharedQuota)]) -> Result<()> {
        let mut entries = Vec::with_capacity(swaps.len());
        for (raw, quota) in swaps {
            entries.push(CasEntry {
                key: quota_key(&quota.name),
                expected: Some(raw.clone()),
                value: encode(quota)?,
            });
        }
        if !self.store.compare_and_put(&entries).await? {
            let names: Vec<&str> = swaps.iter().map(|(_, q)| q.name.as_str()).collect();
            debug!("Write conflict on shared quotas {}", names.join(","));
            return Err(QuotaError::Conflict(names.join(",")));
        }
        Ok(())
    }

    pub async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        match self.store.get(&namespace_key(name)).await? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        let entries = self.store.list_prefix(NAMESPACES_PREFIX).await?;
        entries.iter().map(|(_, v)| decode(v)).collect()
    }

    /// Namespaces `spec`'s selector currently selects.
    pub async fn matching_namespaces(&self, spec: &SharedQuotaSpec) -> Result<Vec<Namespace>> {
        Ok(self
            .list_namespaces()
            .await?
            .into_iter()
            .filter(|ns| spec.selects(&ns.labels))
            .collect())
    }

    /// Quotas whose selector covers `namespace`. A namespace that does not
    /// exist, or has no labels, is covered by none.
    pub async fn quotas_for(&self, namespace: &str) -> Result<Vec<SharedQuota>> {
        let Some(ns) = self.get_namespace(namespace).await? else {
            return Ok(Vec::new());
        };
        if ns.labels.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|q| q.spec.selects(&ns.labels))
            .collect())
    }

    pub async fn quota_names_for(&self, namespace: &str) -> Result<Vec<String>> {
        Ok(self
            .quotas_for(namespace)
            .await?
            .into_iter()
            .map(|q| q.name)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::quota::ResourceQuotaSpec;
    use pkg_types::resource::Quantity;
    use std::collections::HashMap;

    fn spec(team: &str) -> SharedQuotaSpec {
        SharedQuotaSpec {
            selector: HashMap::from([("team".to_string(), team.to_string())]),
            quota: ResourceQuotaSpec {
                hard: [("pods", Quantity::from_units(3))].into_iter().collect(),
                ..Default::default()
            },
        }
    }

    async fn put_namespace(store: &StateStore, name: &str, team: Option<&str>) {
        let ns = Namespace {
            name: name.to_string(),
            labels: team
                .map(|t| HashMap::from([("team".to_string(), t.to_string())]))
                .unwrap_or_default(),
            created_at: Utc::now(),
        };
        store
            .put(&namespace_key(name), &serde_json::to_vec(&ns).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_rejects_duplicates() {
        let client = SharedQuotaClient::new(StateStore::in_memory().await.unwrap());
        let quota = client.create("q", spec("a")).await.unwrap();
        assert_eq!(quota.resource_version, 1);
        assert!(!quota.uid.is_empty());
        assert!(matches!(
            client.create("q", spec("b")).await,
            Err(QuotaError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn stale_status_write_conflicts() {
        let client = SharedQuotaClient::new(StateStore::in_memory().await.unwrap());
        let quota = client.create("q", spec("a")).await.unwrap();

        let mut first = quota.clone();
        first.status.total.used.insert("pods", Quantity::from_units(1));
        let written = client.update_status(&first).await.unwrap();
        assert_eq!(written.resource_version, 2);

        let mut stale = quota;
        stale.status.total.used.insert("pods", Quantity::from_units(2));
        assert!(matches!(
            client.update_status(&stale).await,
            Err(QuotaError::Conflict(_))
        ));
        let stored = client.get("q").await.unwrap().unwrap();
        assert_eq!(stored.status, written.status);
    }

    #[tokio::test]
    async fn batch_status_write_is_all_or_nothing() {
        let client = SharedQuotaClient::new(StateStore::in_memory().await.unwrap());
        let a = client.create("a", spec("x")).await.unwrap();
        let b = client.create("b", spec("x")).await.unwrap();
        // Someone else moves b forward.
        client.update_spec("b", spec("y")).await.unwrap();

        let mut a2 = a.clone();
        a2.status.total.used.insert("pods", Quantity::from_units(1));
        let mut b2 = b.clone();
        b2.status.total.used.insert("pods", Quantity::from_units(1));
        assert!(client.update_statuses(&[a2, b2]).await.is_err());
        assert_eq!(client.get("a").await.unwrap().unwrap(), a);
    }

    #[tokio::test]
    async fn update_spec_keeps_status() {
        let client = SharedQuotaClient::new(StateStore::in_memory().await.unwrap());
        let mut quota = client.create("q", spec("a")).await.unwrap();
        quota.status.total.used.insert("pods", Quantity::from_units(1));
        let quota = client.update_status(&quota).await.unwrap();

        let updated = client.update_spec("q", spec("b")).await.unwrap();
        assert_eq!(updated.status, quota.status);
        assert_eq!(updated.spec, spec("b"));
        assert!(matches!(
            client.update_spec("missing", spec("b")).await,
            Err(QuotaError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn namespace_lookups_follow_labels() {
        let store = StateStore::in_memory().await.unwrap();
        let client = SharedQuotaClient::new(store.clone());
        put_namespace(&store, "a1", Some("a")).await;
        put_namespace(&store, "a2", Some("a")).await;
        put_namespace(&store, "b1", Some("b")).await;
        put_namespace(&store, "bare", None).await;
        client.create("qa", spec("a")).await.unwrap();
        client.create("qb", spec("b")).await.unwrap();

        let names: Vec<_> = client
            .matching_namespaces(&spec("a"))
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.name)
            .collect();
        assert_eq!(names, vec!["a1", "a2"]);
        assert_eq!(client.quota_names_for("b1").await.unwrap(), vec!["qb"]);
        assert!(client.quota_names_for("bare").await.unwrap().is_empty());
        assert!(client.quota_names_for("missing").await.unwrap().is_empty());
    }
}
