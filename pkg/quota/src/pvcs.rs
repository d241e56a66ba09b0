use async_trait::async_trait;
use pkg_constants::state::PVCS_PREFIX;
use pkg_state::client::StateStore;
use pkg_types::admission::Operation;
use pkg_types::quota::{ScopedResourceSelectorRequirement, SharedQuota};
use pkg_types::resource::{self as res, Quantity, ResourceList};
use pkg_types::volume::PersistentVolumeClaim;

use crate::generic;
use crate::object::{self, QuotaObject};
use crate::{Evaluator, Result, UsageStats, UsageStatsOptions};

const PVC_OBJECT_COUNT: &str = "count/persistentvolumeclaims";

const PVC_RESOURCES: &[&str] = &[res::PERSISTENT_VOLUME_CLAIMS, res::REQUESTS_STORAGE];

/// `<class>.storageclass.storage.k8s.io/<resource>` scopes a resource to one
/// storage class.
const STORAGE_CLASS_SUFFIX: &str = ".storageclass.storage.k8s.io/";

pub struct PersistentVolumeClaimEvaluator {
    store: StateStore,
}

impl PersistentVolumeClaimEvaluator {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Evaluator for PersistentVolumeClaimEvaluator {
    fn group_resource(&self) -> &'static str {
        object::PERSISTENT_VOLUME_CLAIMS
    }

    fn constraints(&self, _required: &[String], object: &QuotaObject) -> Result<()> {
        object.as_persistent_volume_claim().map(|_| ())
    }

    fn handles(&self, operation: Operation) -> bool {
        matches!(operation, Operation::Create | Operation::Update)
    }

    fn matches(&self, quota: &SharedQuota, object: &QuotaObject) -> Result<bool> {
        generic::matches(
            quota,
            object,
            |input| self.matching_resources(input),
            generic::matches_no_scope,
        )
    }

    fn matching_resources(&self, input: &[String]) -> Vec<String> {
        input
            .iter()
            .filter(|name| {
                name.as_str() == PVC_OBJECT_COUNT
                    || PVC_RESOURCES.contains(&name.as_str())
                    || PVC_RESOURCES
                        .iter()
                        .any(|r| name.ends_with(&format!("{}{}", STORAGE_CLASS_SUFFIX, r)))
            })
            .cloned()
            .collect()
    }

    fn matching_scopes(
        &self,
        object: &QuotaObject,
        selectors: &[ScopedResourceSelectorRequirement],
    ) -> Result<Vec<ScopedResourceSelectorRequirement>> {
        generic::matching_scopes(object, selectors, generic::matches_no_scope)
    }

    fn usage(&self, object: &QuotaObject) -> Result<ResourceList> {
        Ok(pvc_usage(object.as_persistent_volume_claim()?))
    }

    async fn usage_stats(&self, options: &UsageStatsOptions) -> Result<UsageStats> {
        let claims = generic::list_namespaced(
            &self.store,
            PVCS_PREFIX,
            object::PERSISTENT_VOLUME_CLAIMS,
            &options.namespace,
        )
        .await?;
        generic::calculate_usage_stats(options, &claims, generic::matches_no_scope, |o| {
            self.usage(o)
        })
    }
}

pub fn pvc_usage(pvc: &PersistentVolumeClaim) -> ResourceList {
    let class = pvc
        .spec
        .storage_class_name
        .as_deref()
        .filter(|c| !c.is_empty());
    let by_class = |resource: &str| class.map(|c| format!("{}{}{}", c, STORAGE_CLASS_SUFFIX, resource));

    let mut result = ResourceList::new();
    result.insert(res::PERSISTENT_VOLUME_CLAIMS, Quantity::from_units(1));
    result.insert(PVC_OBJECT_COUNT, Quantity::from_units(1));
    if let Some(name) = by_class(res::PERSISTENT_VOLUME_CLAIMS) {
        result.insert(name, Quantity::from_units(1));
    }
    if let Some(storage) = pvc.spec.requests.get(res::STORAGE) {
        result.insert(res::REQUESTS_STORAGE, storage);
        if let Some(name) = by_class(res::REQUESTS_STORAGE) {
            result.insert(name, storage);
        }
    }
    result
}
