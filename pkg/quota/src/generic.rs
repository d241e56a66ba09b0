use pkg_state::client::StateStore;
use pkg_types::quota::{ScopedResourceSelectorRequirement, SharedQuota};
use pkg_types::resource::{Quantity, ResourceList};
use tracing::warn;

use crate::object::QuotaObject;
use crate::{Result, UsageStats, UsageStatsOptions};

/// Decides whether an object satisfies one scope requirement.
pub type MatchesScopeFn = fn(&ScopedResourceSelectorRequirement, &QuotaObject) -> Result<bool>;

/// Shared body of [`crate::Evaluator::matches`]. Resource matching looks at
/// the hard limits already observed in status, not the spec.
pub fn matches<F>(
    quota: &SharedQuota,
    object: &QuotaObject,
    matching_resources: F,
    scope_fn: MatchesScopeFn,
) -> Result<bool>
where
    F: Fn(&[String]) -> Vec<String>,
{
    let hard = quota.status.total.hard.names();
    if matching_resources(&hard).is_empty() {
        return Ok(false);
    }
    for selector in quota.spec.quota.scope_selectors() {
        if !scope_fn(&selector, object)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// For kinds that no scope applies to.
pub fn matches_no_scope(_: &ScopedResourceSelectorRequirement, _: &QuotaObject) -> Result<bool> {
    Ok(false)
}

pub fn matching_scopes(
    object: &QuotaObject,
    selectors: &[ScopedResourceSelectorRequirement],
    scope_fn: MatchesScopeFn,
) -> Result<Vec<ScopedResourceSelectorRequirement>> {
    let mut matched = Vec::new();
    for selector in selectors {
        if scope_fn(selector, object)? {
            matched.push(selector.clone());
        }
    }
    Ok(matched)
}

/// Sum usage over `objects` that satisfy every scope selector. Requested
/// resources start at zero so they always appear in the result.
pub fn calculate_usage_stats<U>(
    options: &UsageStatsOptions,
    objects: &[QuotaObject],
    scope_fn: MatchesScopeFn,
    usage_fn: U,
) -> Result<UsageStats>
where
    U: Fn(&QuotaObject) -> Result<ResourceList>,
{
    let mut used: ResourceList = options
        .resources
        .iter()
        .map(|name| (name.clone(), Quantity::ZERO))
        .collect();
    'objects: for object in objects {
        for selector in &options.scope_selectors {
            if !scope_fn(selector, object)? {
                continue 'objects;
            }
        }
        used = used.add(&usage_fn(object)?);
    }
    Ok(UsageStats { used })
}

/// Every stored object of `resource` in `namespace`. Entries that fail to
/// decode are skipped.
pub async fn list_namespaced(
    store: &StateStore,
    prefix: &str,
    resource: &str,
    namespace: &str,
) -> Result<Vec<QuotaObject>> {
    let entries = store
        .list_prefix(&format!("{}{}/", prefix, namespace))
        .await?;
    let mut objects = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        match QuotaObject::decode_slice(resource, &value) {
            Ok(Some(object)) => objects.push(object),
            Ok(None) => {}
            Err(e) => warn!("Skipping undecodable object {}: {}", key, e),
        }
    }
    Ok(objects)
}
