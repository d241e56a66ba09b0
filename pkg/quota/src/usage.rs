use pkg_types::quota::ResourceQuotaSpec;
use pkg_types::resource::{self as res, ResourceList};

use crate::registry::Registry;
use crate::{Result, UsageStatsOptions};

/// Observed usage in `namespace` for the resources `spec.hard` limits that
/// some evaluator can measure. Untracked hard names are left out.
pub async fn calculate_usage(
    namespace: &str,
    spec: &ResourceQuotaSpec,
    registry: &Registry,
) -> Result<ResourceList> {
    let hard = spec.hard.names();
    let potential: Vec<String> = registry
        .list()
        .iter()
        .flat_map(|e| e.matching_resources(&hard))
        .collect();
    let matched = res::intersection(&hard, &potential);
    let scope_selectors = spec.scope_selectors();

    let mut used = ResourceList::new();
    for evaluator in registry.list() {
        let resources = evaluator.matching_resources(&matched);
        if resources.is_empty() {
            continue;
        }
        let stats = evaluator
            .usage_stats(&UsageStatsOptions {
                namespace: namespace.to_string(),
                scope_selectors: scope_selectors.clone(),
                resources,
            })
            .await?;
        used = used.add(&stats.used);
    }
    Ok(used.mask(&matched))
}
