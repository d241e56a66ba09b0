use pkg_constants::quota::ADMISSION_CONFLICT_RETRIES;
use pkg_quota::accessor::SharedQuotaClient;
use pkg_quota::registry::Registry;
use pkg_quota::{Evaluator, QuotaError};
use pkg_state::locks::{LockFactory, OrderedLockGuard};
use pkg_types::admission::Operation;
use pkg_types::quota::{ResourceQuotaStatus, SharedQuota};
use pkg_types::resource::ResourceList;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, timeout_at};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::AdmissionError;
use crate::attributes::Attributes;

/// What admitting the object costs one quota.
#[derive(Debug, Clone, PartialEq)]
pub struct Charge {
    /// Index into the quotas passed to [`check_request`].
    pub index: usize,
    /// The request's usage, restricted to what this quota limits.
    pub requested: ResourceList,
    /// `status.total.used` once the charge is applied.
    pub used: ResourceList,
}

/// Admission gate for shared quotas.
///
/// Covering quotas are locked by uid through a [`LockFactory`], which always
/// acquires in sorted order, so concurrent requests over overlapping quota
/// sets cannot deadlock. At most `workers` evaluations run at once. Reaching
/// the point of writing a charge is bounded by `timeout`; running out of time
/// is an error, never an allow, and leaves every quota untouched.
pub struct QuotaEvaluator {
    quotas: SharedQuotaClient,
    registry: Arc<Registry>,
    locks: Arc<LockFactory>,
    workers: Arc<Semaphore>,
    timeout: Duration,
}

impl QuotaEvaluator {
    pub fn new(
        quotas: SharedQuotaClient,
        registry: Arc<Registry>,
        workers: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            quotas,
            registry,
            locks: Arc::new(LockFactory::new()),
            workers: Arc::new(Semaphore::new(workers.max(1))),
            timeout,
        }
    }

    /// Admit or reject a request. On success every charged quota already
    /// carries the new usage (unless the request is a dry run).
    ///
    /// The timeout bounds waiting for a worker, the quota locks and the
    /// decision. Once a charge is being written it runs to completion and its
    /// real outcome is returned, so a timed out request has charged nothing.
    pub async fn evaluate(&self, attrs: &Attributes) -> Result<(), AdmissionError> {
        // Subresources and cluster-scoped objects are never charged.
        if attrs.sub_resource.is_some() || attrs.namespace.is_empty() {
            return Ok(());
        }
        let Some(evaluator) = self.registry.get(&attrs.resource) else {
            return Ok(());
        };
        if !evaluator.handles(attrs.operation) {
            return Ok(());
        }

        let span = info_span!(
            "admission",
            uid = %attrs.uid,
            namespace = %attrs.namespace,
            resource = %attrs.resource,
            operation = %attrs.operation,
        );
        self.evaluate_with_retries(attrs, evaluator.as_ref())
            .instrument(span)
            .await
    }

    async fn evaluate_with_retries(
        &self,
        attrs: &Attributes,
        evaluator: &dyn Evaluator,
    ) -> Result<(), AdmissionError> {
        let deadline = Instant::now() + self.timeout;
        for attempt in 0..=ADMISSION_CONFLICT_RETRIES {
            let prepared = match timeout_at(deadline, self.prepare(attrs, evaluator)).await {
                Ok(prepared) => prepared?,
                Err(_) => {
                    warn!(
                        "Admission of {} {}/{} timed out after {:?}",
                        attrs.resource, attrs.namespace, attrs.name, self.timeout
                    );
                    return Err(AdmissionError::Timeout(self.timeout));
                }
            };
            let Some(pending) = prepared else {
                return Ok(());
            };
            if self.commit(attrs, pending).await? {
                return Ok(());
            }
            debug!("Shared quota status moved during admission (attempt {})", attempt + 1);
        }
        Err(AdmissionError::Internal(format!(
            "unable to update shared quota status for namespace {} after {} retries",
            attrs.namespace, ADMISSION_CONFLICT_RETRIES
        )))
    }

    /// Take a worker and the covering quota locks, then decide on fresh
    /// copies. `None` means the request is admitted with nothing to write.
    async fn prepare(
        &self,
        attrs: &Attributes,
        evaluator: &dyn Evaluator,
    ) -> Result<Option<PendingCharge>, AdmissionError> {
        let permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AdmissionError::Internal("admission worker pool closed".into()))?;

        let covering = self.quotas.quotas_for(&attrs.namespace).await?;
        if covering.is_empty() {
            return Ok(None);
        }

        let guard = self
            .locks
            .acquire_ordered(covering.iter().map(|q| q.uid.clone()))
            .await;

        let mut quotas = Vec::with_capacity(covering.len());
        for listed in &covering {
            match self.quotas.get(&listed.name).await? {
                Some(current) if current.uid == listed.uid => quotas.push(current),
                _ => debug!("Shared quota {} went away before it was locked", listed.name),
            }
        }

        let charges = check_request(&quotas, attrs, evaluator)?;
        if charges.is_empty() {
            return Ok(None);
        }
        if attrs.dry_run {
            debug!("Dry run fits in {} shared quota(s)", charges.len());
            return Ok(None);
        }

        let updated = charges
            .into_iter()
            .map(|charge| apply_charge(&quotas[charge.index], &attrs.namespace, charge))
            .collect();
        Ok(Some(PendingCharge {
            updated,
            _guard: guard,
            _permit: permit,
        }))
    }

    /// Write a decided charge. The write runs on its own task holding the
    /// locks, so it finishes even if the caller goes away. `Ok(false)` means
    /// a quota changed underneath and the round must be redone.
    async fn commit(
        &self,
        attrs: &Attributes,
        pending: PendingCharge,
    ) -> Result<bool, AdmissionError> {
        let quotas = self.quotas.clone();
        let write = tokio::spawn(
            async move {
                let result = quotas.update_statuses(&pending.updated).await;
                drop(pending);
                result
            }
            .in_current_span(),
        );
        let written = write
            .await
            .map_err(|e| AdmissionError::Internal(format!("shared quota write aborted: {}", e)))?;
        match written {
            Ok(written) => {
                for quota in &written {
                    info!(
                        "Charged {} {}/{} to shared quota {}",
                        attrs.resource, attrs.namespace, attrs.name, quota.name
                    );
                }
                Ok(true)
            }
            Err(QuotaError::Conflict(_)) | Err(QuotaError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// A decided charge waiting to be written, still holding its worker slot and
/// the locks of every quota it touches.
struct PendingCharge {
    updated: Vec<SharedQuota>,
    _guard: OrderedLockGuard,
    _permit: OwnedSemaphorePermit,
}

fn forbidden(attrs: &Attributes, message: impl std::fmt::Display) -> AdmissionError {
    AdmissionError::Forbidden(format!(
        "{} \"{}\" is forbidden: {}",
        attrs.resource, attrs.name, message
    ))
}

/// Decide the request against already-loaded quotas. Returns one charge per
/// quota the object counts against, or nothing when no quota is affected.
pub fn check_request(
    quotas: &[SharedQuota],
    attrs: &Attributes,
    evaluator: &dyn Evaluator,
) -> Result<Vec<Charge>, AdmissionError> {
    let object = attrs.object.as_ref().ok_or_else(|| {
        AdmissionError::BadRequest(format!(
            "{} request for {} carries no object",
            attrs.operation, attrs.resource
        ))
    })?;

    let mut interesting = Vec::new();
    for (index, quota) in quotas.iter().enumerate() {
        if !evaluator.matches(quota, object)? {
            continue;
        }
        let restricted = evaluator.matching_resources(&quota.status.total.hard.names());
        if let Err(e) = evaluator.constraints(&restricted, object) {
            return Err(forbidden(attrs, format!("failed quota: {}: {}", quota.name, e)));
        }
        let unknown: Vec<&str> = restricted
            .iter()
            .filter(|r| !quota.status.total.used.contains_key(r))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            return Err(forbidden(
                attrs,
                format!(
                    "status unknown for quota: {}, resources: {}",
                    quota.name,
                    unknown.join(",")
                ),
            ));
        }
        interesting.push(index);
    }
    if interesting.is_empty() {
        return Ok(Vec::new());
    }

    let mut delta = evaluator.usage(object)?;
    if attrs.operation == Operation::Update {
        let old = attrs.old_object.as_ref().ok_or_else(|| {
            forbidden(
                attrs,
                "unable to get previous usage since prior version of object was not found",
            )
        })?;
        delta = delta.subtract(&evaluator.usage(old)?);
    }
    let delta = delta.remove_zeros();
    if delta.is_empty() {
        return Ok(Vec::new());
    }

    let mut charges = Vec::with_capacity(interesting.len());
    for index in interesting {
        let status = &quotas[index].status.total;
        let requested = delta.mask(&status.hard.names());
        let used = status.used.add(&requested);
        let (fits, exceeded) = used.mask(&requested.names()).less_than_or_equal(&status.hard);
        if !fits {
            return Err(forbidden(
                attrs,
                format!(
                    "exceeded quota: {}, requested: {}, used: {}, limited: {}",
                    quotas[index].name,
                    requested.mask(&exceeded),
                    status.used.mask(&exceeded),
                    status.hard.mask(&exceeded)
                ),
            ));
        }
        charges.push(Charge {
            index,
            requested,
            used,
        });
    }
    Ok(charges)
}

/// The quota with `charge` applied. The namespace's breakdown entry moves by
/// the same amount as the total so the two stay consistent.
fn apply_charge(quota: &SharedQuota, namespace: &str, charge: Charge) -> SharedQuota {
    let mut updated = quota.clone();
    let entry = updated
        .status
        .namespace_status(namespace)
        .cloned()
        .unwrap_or_else(|| ResourceQuotaStatus {
            hard: updated.status.total.hard.clone(),
            used: ResourceList::new(),
        });
    updated.status.upsert_namespace(
        namespace,
        ResourceQuotaStatus {
            hard: entry.hard,
            used: entry.used.add(&charge.requested),
        },
    );
    updated.status.total.used = charge.used;
    updated
}
