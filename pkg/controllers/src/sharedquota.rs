use pkg_constants::quota::{QUEUE_BASE_DELAY_MS, QUEUE_MAX_DELAY_SECS};
use pkg_constants::state::{
    NAMESPACES_PREFIX, PODS_PREFIX, PVCS_PREFIX, SERVICES_PREFIX, SHARED_QUOTAS_PREFIX,
};
use pkg_metrics::{
    MetricsRegistry, QUEUE_DEPTH, RECONCILE_ERRORS, RECONCILE_TOTAL, STATUS_WRITES,
};
use pkg_quota::QuotaError;
use pkg_quota::accessor::SharedQuotaClient;
use pkg_quota::clock::Clock;
use pkg_quota::pods::is_charged;
use pkg_quota::registry::Registry;
use pkg_quota::services::quota_service_type;
use pkg_quota::usage::calculate_usage;
use pkg_state::client::StateStore;
use pkg_state::watch::{EventType, WatchEvent};
use pkg_types::namespace::Namespace;
use pkg_types::pod::Pod;
use pkg_types::quota::{ResourceQuotaStatus, SharedQuota};
use pkg_types::service::Service;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::queue::WorkQueue;

/// Result of reconciling one shared quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Status changed and was written.
    Updated,
    /// Recomputed status equals the stored one.
    Unchanged,
    /// The quota no longer exists.
    Missing,
}

/// Keeps `status` of every shared quota in line with what its member
/// namespaces actually use.
///
/// Each pass recomputes usage per selected namespace and folds it into the
/// total by swapping out that namespace's previous contribution. Passes run
/// on resync, on quota spec changes, and when workload or namespace events
/// map back to a quota.
pub struct SharedQuotaController {
    store: StateStore,
    quotas: SharedQuotaClient,
    registry: Arc<Registry>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsRegistry>,
    queue: Arc<WorkQueue>,
    resync_period: Duration,
    workers: usize,
}

impl SharedQuotaController {
    pub fn new(
        store: StateStore,
        registry: Arc<Registry>,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsRegistry>,
        resync_period: Duration,
        workers: usize,
    ) -> Self {
        Self {
            quotas: SharedQuotaClient::new(store.clone()),
            store,
            registry,
            clock,
            metrics,
            queue: WorkQueue::new(
                Duration::from_millis(QUEUE_BASE_DELAY_MS),
                Duration::from_secs(QUEUE_MAX_DELAY_SECS),
            ),
            resync_period,
            workers: workers.max(1),
        }
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        self.queue.clone()
    }

    /// Spawn the event pump and the workers, and queue every existing quota.
    pub fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        info!(
            "SharedQuotaController started (workers={}, resync={}s)",
            self.workers,
            self.resync_period.as_secs()
        );
        let mut handles = Vec::with_capacity(self.workers + 1);

        // Subscribe before listing so nothing created in between is missed.
        let events = self.store.event_log.subscribe();
        let pump = self.clone();
        handles.push(tokio::spawn(async move {
            pump.enqueue_all().await;
            pump.pump_events(events).await;
        }));

        for _ in 0..self.workers {
            let worker = self.clone();
            handles.push(tokio::spawn(async move { worker.run_worker().await }));
        }
        handles
    }

    async fn enqueue_all(&self) {
        match self.quotas.list().await {
            Ok(quotas) => {
                for quota in quotas {
                    self.queue.add(&quota.name);
                }
            }
            Err(e) => warn!("SharedQuotaController failed to list quotas: {}", e),
        }
    }

    async fn run_worker(&self) {
        while let Some(name) = self.queue.get().await {
            self.metrics.gauge_set(QUEUE_DEPTH, self.queue.len() as i64);
            self.process(&name).await;
            self.queue.done(&name);
        }
    }

    async fn process(&self, name: &str) {
        self.metrics.counter_inc(RECONCILE_TOTAL);
        match self.sync(name).await {
            Ok(SyncOutcome::Missing) => {
                self.queue.forget(name);
            }
            Ok(_) => {
                self.queue.forget(name);
                self.queue.add_after(name, self.resync_period);
            }
            Err(e) => {
                self.metrics.counter_inc(RECONCILE_ERRORS);
                warn!(
                    "Failed to sync shared quota {} (retry {}): {}",
                    name,
                    self.queue.num_requeues(name) + 1,
                    e
                );
                self.queue.add_rate_limited(name);
            }
        }
    }

    /// One reconcile pass for the named quota.
    pub async fn sync(&self, name: &str) -> Result<SyncOutcome, QuotaError> {
        let Some(quota) = self.quotas.get(name).await? else {
            debug!("Shared quota {} is gone, nothing to sync", name);
            return Ok(SyncOutcome::Missing);
        };
        let updated = self.recalculate(&quota).await?;
        if updated == quota {
            debug!("Shared quota {} unchanged", name);
            return Ok(SyncOutcome::Unchanged);
        }
        match self.quotas.update_status(&updated).await {
            Ok(_) => {
                self.metrics.counter_inc(STATUS_WRITES);
                info!(
                    "Updated shared quota {} status: used {}",
                    name, updated.status.total.used
                );
                Ok(SyncOutcome::Updated)
            }
            Err(QuotaError::NotFound(_)) => Ok(SyncOutcome::Missing),
            Err(e) => Err(e),
        }
    }

    /// The quota with freshly computed status. Pure apart from reads.
    pub async fn recalculate(&self, original: &SharedQuota) -> Result<SharedQuota, QuotaError> {
        let mut quota = original.clone();
        let namespaces = self.quotas.matching_namespaces(&quota.spec).await?;
        let members: HashSet<&str> = namespaces.iter().map(|n| n.name.as_str()).collect();

        for ns in &namespaces {
            let previous = quota
                .status
                .namespace_status(&ns.name)
                .map(|s| s.used.clone())
                .unwrap_or_default();
            let used = calculate_usage(&ns.name, &quota.spec.quota, &self.registry).await?;
            quota.status.total.used = quota.status.total.used.subtract(&previous).add(&used);
            quota.status.upsert_namespace(
                &ns.name,
                ResourceQuotaStatus {
                    hard: quota.spec.quota.hard.clone(),
                    used,
                },
            );
        }

        let stale: Vec<String> = quota
            .status
            .namespaces
            .iter()
            .filter(|n| !members.contains(n.namespace.as_str()))
            .map(|n| n.namespace.clone())
            .collect();
        for ns in stale {
            if let Some(removed) = quota.status.remove_namespace(&ns) {
                debug!("Shared quota {} no longer selects namespace {}", quota.name, ns);
                quota.status.total.used = quota.status.total.used.subtract(&removed.used);
            }
        }

        quota.status.total.hard = quota.spec.quota.hard.clone();
        Ok(quota)
    }

    async fn pump_events(&self, mut events: tokio::sync::broadcast::Receiver<WatchEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.handle_event(&event).await,
                Err(RecvError::Lagged(missed)) => {
                    warn!(
                        "SharedQuotaController missed {} store events, requeueing all quotas",
                        missed
                    );
                    self.enqueue_all().await;
                }
                Err(RecvError::Closed) => {
                    info!("SharedQuotaController event stream closed");
                    self.queue.shut_down();
                    return;
                }
            }
        }
    }

    /// Route one store event to the quotas it can affect.
    pub async fn handle_event(&self, event: &WatchEvent) {
        for name in self.quotas_for_event(event).await {
            self.queue.add(&name);
        }
    }

    async fn quotas_for_event(&self, event: &WatchEvent) -> Vec<String> {
        if let Some(name) = event.key.strip_prefix(SHARED_QUOTAS_PREFIX) {
            return match quota_event_needs_sync(event) {
                true => vec![name.to_string()],
                false => Vec::new(),
            };
        }
        if event.key.starts_with(NAMESPACES_PREFIX) {
            return self.quotas_for_namespace_event(event).await;
        }
        let Some((resource, namespace)) = workload_event_namespace(&event.key) else {
            return Vec::new();
        };
        let relevant = match event.event_type {
            EventType::Delete => true,
            EventType::Put if event.is_create() => false,
            EventType::Put => workload_update_needs_sync(
                resource,
                event.old_value.as_deref(),
                event.value.as_deref(),
                self.clock.as_ref(),
            ),
        };
        if !relevant {
            return Vec::new();
        }
        match self.tracking_quotas_for(namespace).await {
            Ok(names) => {
                debug!(
                    "Workload change {} maps to shared quotas {:?}",
                    event.key, names
                );
                names
            }
            Err(e) => {
                warn!("Failed to map {} to shared quotas: {}", event.key, e);
                Vec::new()
            }
        }
    }

    /// Quotas covering `namespace` that track something an evaluator can
    /// measure.
    pub async fn tracking_quotas_for(&self, namespace: &str) -> Result<Vec<String>, QuotaError> {
        Ok(self
            .quotas
            .quotas_for(namespace)
            .await?
            .into_iter()
            .filter(|q| self.registry.tracks_any(&q.status.total.hard.names()))
            .map(|q| q.name)
            .collect())
    }

    /// A namespace whose labels change may join or leave quotas: wake those
    /// selecting either label set.
    async fn quotas_for_namespace_event(&self, event: &WatchEvent) -> Vec<String> {
        let labels = |bytes: Option<&[u8]>| -> Option<HashMap<String, String>> {
            bytes
                .and_then(|b| serde_json::from_slice::<Namespace>(b).ok())
                .map(|ns| ns.labels)
        };
        let old = labels(event.old_value.as_deref());
        let new = labels(event.value.as_deref());
        if old == new {
            return Vec::new();
        }
        let quotas = match self.quotas.list().await {
            Ok(quotas) => quotas,
            Err(e) => {
                warn!("Failed to list shared quotas for {}: {}", event.key, e);
                return Vec::new();
            }
        };
        let mut names = BTreeSet::new();
        for quota in quotas {
            let hit = |l: &Option<HashMap<String, String>>| {
                l.as_ref().is_some_and(|l| quota.spec.selects(l))
            };
            if hit(&old) || hit(&new) {
                names.insert(quota.name.clone());
            }
        }
        names.into_iter().collect()
    }
}

/// Creates always sync; updates only when the spec moved, so status writes
/// do not feed back into the queue. Deletes need nothing.
fn quota_event_needs_sync(event: &WatchEvent) -> bool {
    match event.event_type {
        EventType::Delete => false,
        EventType::Put if event.is_create() => true,
        EventType::Put => {
            let spec = |bytes: Option<&[u8]>| {
                bytes
                    .and_then(|b| serde_json::from_slice::<SharedQuota>(b).ok())
                    .map(|q| q.spec)
            };
            spec(event.old_value.as_deref()) != spec(event.value.as_deref())
        }
    }
}

/// `(resource, namespace)` for keys of tracked workload kinds.
fn workload_event_namespace(key: &str) -> Option<(&'static str, &str)> {
    let kinds = [
        (PODS_PREFIX, pkg_quota::object::PODS),
        (SERVICES_PREFIX, pkg_quota::object::SERVICES),
        (PVCS_PREFIX, pkg_quota::object::PERSISTENT_VOLUME_CLAIMS),
    ];
    kinds.iter().find_map(|(prefix, resource)| {
        let rest = key.strip_prefix(prefix)?;
        let (namespace, _) = rest.split_once('/')?;
        Some((*resource, namespace))
    })
}

/// Whether an update to a workload object can change quota usage. Only
/// transitions the usage functions observe are let through.
pub fn workload_update_needs_sync(
    resource: &str,
    old: Option<&[u8]>,
    new: Option<&[u8]>,
    clock: &dyn Clock,
) -> bool {
    fn decode<T: serde::de::DeserializeOwned>(bytes: Option<&[u8]>) -> Option<T> {
        bytes.and_then(|b| serde_json::from_slice(b).ok())
    }
    match resource {
        pkg_quota::object::PODS => match (decode::<Pod>(old), decode::<Pod>(new)) {
            (Some(old), Some(new)) => is_charged(&old, clock) && !is_charged(&new, clock),
            _ => true,
        },
        pkg_quota::object::SERVICES => match (decode::<Service>(old), decode::<Service>(new)) {
            (Some(old), Some(new)) => quota_service_type(&old) != quota_service_type(&new),
            _ => true,
        },
        _ => true,
    }
}
