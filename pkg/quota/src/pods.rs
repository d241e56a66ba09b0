use async_trait::async_trait;
use chrono::Duration;
use pkg_constants::state::PODS_PREFIX;
use pkg_state::client::StateStore;
use pkg_types::admission::Operation;
use pkg_types::pod::{ContainerSpec, Pod};
use pkg_types::quota::{
    ResourceQuotaScope, ScopeSelectorOperator, ScopedResourceSelectorRequirement, SharedQuota,
};
use pkg_types::resource::{self as res, Quantity, ResourceList};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::clock::Clock;
use crate::generic;
use crate::object::{self, QuotaObject};
use crate::{Evaluator, QuotaError, Result, UsageStats, UsageStatsOptions};

const POD_OBJECT_COUNT: &str = "count/pods";

/// Resources charged for pods.
const POD_RESOURCES: &[&str] = &[
    POD_OBJECT_COUNT,
    res::CPU,
    res::MEMORY,
    res::EPHEMERAL_STORAGE,
    res::GPU,
    res::REQUESTS_CPU,
    res::REQUESTS_MEMORY,
    res::REQUESTS_EPHEMERAL_STORAGE,
    res::REQUESTS_GPU,
    res::LIMITS_CPU,
    res::LIMITS_MEMORY,
    res::LIMITS_EPHEMERAL_STORAGE,
    res::PODS,
];

/// Quota resource families matched by prefix.
const POD_RESOURCE_PREFIXES: &[&str] = &[res::HUGEPAGES_PREFIX, res::REQUESTS_HUGEPAGES_PREFIX];

/// Prefixes that may appear in a container's own requests.
const REQUESTED_RESOURCE_PREFIXES: &[&str] = &[res::HUGEPAGES_PREFIX];

/// If a quota tracks any of these, every container must declare them.
/// Frozen: other resources are never required this way.
const VALIDATION_SET: &[&str] = &[
    res::CPU,
    res::MEMORY,
    res::REQUESTS_CPU,
    res::REQUESTS_MEMORY,
    res::LIMITS_CPU,
    res::LIMITS_MEMORY,
];

/// Label key the `PriorityClass` scope selects on.
const PRIORITY_CLASS_LABEL: &str = "PriorityClass";

pub struct PodEvaluator {
    store: StateStore,
    clock: Arc<dyn Clock>,
}

impl PodEvaluator {
    pub fn new(store: StateStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

#[async_trait]
impl Evaluator for PodEvaluator {
    fn group_resource(&self) -> &'static str {
        object::PODS
    }

    fn constraints(&self, required: &[String], object: &QuotaObject) -> Result<()> {
        let pod = object.as_pod()?;
        let required: BTreeSet<&str> = required
            .iter()
            .map(String::as_str)
            .filter(|r| VALIDATION_SET.contains(r))
            .collect();
        if required.is_empty() {
            return Ok(());
        }
        let mut missing = BTreeSet::new();
        for container in pod.spec.containers.iter().chain(&pod.spec.init_containers) {
            missing_container_resources(container, &required, &mut missing);
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(QuotaError::Constraint {
                missing: missing.into_iter().collect(),
            })
        }
    }

    fn handles(&self, operation: Operation) -> bool {
        operation == Operation::Create
    }

    fn matches(&self, quota: &SharedQuota, object: &QuotaObject) -> Result<bool> {
        generic::matches(
            quota,
            object,
            |input| self.matching_resources(input),
            pod_matches_scope,
        )
    }

    fn matching_resources(&self, input: &[String]) -> Vec<String> {
        let mut result = res::intersection(input, POD_RESOURCES);
        for name in input {
            if res::contains_prefix(POD_RESOURCE_PREFIXES, name)
                || is_extended_resource_name_for_quota(name)
            {
                result.push(name.clone());
            }
        }
        result
    }

    fn matching_scopes(
        &self,
        object: &QuotaObject,
        selectors: &[ScopedResourceSelectorRequirement],
    ) -> Result<Vec<ScopedResourceSelectorRequirement>> {
        generic::matching_scopes(object, selectors, pod_matches_scope)
    }

    fn usage(&self, object: &QuotaObject) -> Result<ResourceList> {
        Ok(pod_usage(object.as_pod()?, self.clock.as_ref()))
    }

    async fn usage_stats(&self, options: &UsageStatsOptions) -> Result<UsageStats> {
        let pods = generic::list_namespaced(
            &self.store,
            PODS_PREFIX,
            object::PODS,
            &options.namespace,
        )
        .await?;
        generic::calculate_usage_stats(options, &pods, pod_matches_scope, |o| self.usage(o))
    }
}

/// Only `requests.`-prefixed names are quotable for extended resources.
fn is_extended_resource_name_for_quota(name: &str) -> bool {
    !res::is_native_resource(name) && name.starts_with(res::DEFAULT_REQUESTS_PREFIX)
}

fn mask_with_prefix(name: &str, prefix: &str) -> String {
    format!("{}{}", prefix, name)
}

fn missing_container_resources(
    container: &ContainerSpec,
    required: &BTreeSet<&str>,
    missing: &mut BTreeSet<String>,
) {
    let usage = compute_usage(&container.resources.requests, &container.resources.limits);
    for name in required {
        if !usage.contains_key(name) {
            missing.insert(name.to_string());
        }
    }
}

/// Maps declared requests and limits onto the quota resource names they
/// count against. Always charges one `pods`.
fn compute_usage(requests: &ResourceList, limits: &ResourceList) -> ResourceList {
    let mut result = ResourceList::new();
    result.insert(res::PODS, Quantity::from_units(1));

    let aliased = [
        (res::CPU, res::REQUESTS_CPU, res::LIMITS_CPU),
        (res::MEMORY, res::REQUESTS_MEMORY, res::LIMITS_MEMORY),
        (
            res::EPHEMERAL_STORAGE,
            res::REQUESTS_EPHEMERAL_STORAGE,
            res::LIMITS_EPHEMERAL_STORAGE,
        ),
    ];
    for (name, request_name, limit_name) in aliased {
        if let Some(request) = requests.get(name) {
            result.insert(name, request);
            result.insert(request_name, request);
        }
        if let Some(limit) = limits.get(name) {
            result.insert(limit_name, limit);
        }
    }
    if let Some(request) = requests.get(res::GPU) {
        result.insert(res::GPU, request);
        result.insert(res::REQUESTS_GPU, request);
    }

    for (name, request) in requests.iter() {
        if res::contains_prefix(REQUESTED_RESOURCE_PREFIXES, name) {
            result.insert(name.clone(), *request);
            result.insert(mask_with_prefix(name, res::DEFAULT_REQUESTS_PREFIX), *request);
        }
        if res::is_extended_resource_name(name) {
            result.insert(mask_with_prefix(name, res::DEFAULT_REQUESTS_PREFIX), *request);
        }
    }
    result
}

/// Usage of a single pod as of `clock`.
pub fn pod_usage(pod: &Pod, clock: &dyn Clock) -> ResourceList {
    let mut result = ResourceList::new();
    // Object count tracks storage, so it is charged whatever the pod's state.
    result.insert(POD_OBJECT_COUNT, Quantity::from_units(1));
    if !is_charged(pod, clock) {
        return result;
    }

    let mut requests = ResourceList::new();
    let mut limits = ResourceList::new();
    for container in &pod.spec.containers {
        requests = requests.add(&container.resources.requests);
        limits = limits.add(&container.resources.limits);
    }
    // Init containers run one at a time before the rest start.
    for container in &pod.spec.init_containers {
        requests = requests.max(&container.resources.requests);
        limits = limits.max(&container.resources.limits);
    }
    result.add(&compute_usage(&requests, &limits))
}

/// Whether a pod's compute resources count against quota. Terminal pods and
/// pods stuck terminating past their grace period do not.
pub fn is_charged(pod: &Pod, clock: &dyn Clock) -> bool {
    if pod.phase.is_terminal() {
        return false;
    }
    if let (Some(deleted_at), Some(grace)) =
        (pod.deletion_timestamp, pod.deletion_grace_period_seconds)
        && clock.now() > deleted_at + Duration::seconds(grace)
    {
        return false;
    }
    true
}

pub fn is_terminating(pod: &Pod) -> bool {
    pod.spec.active_deadline_seconds.is_some_and(|d| d >= 0)
}

/// Best effort when no container declares a nonzero cpu or memory request
/// or limit.
pub fn is_best_effort(pod: &Pod) -> bool {
    let declares = |list: &ResourceList| {
        [res::CPU, res::MEMORY]
            .iter()
            .any(|name| list.get(name).is_some_and(|q| !q.is_zero()))
    };
    !pod.spec
        .containers
        .iter()
        .chain(&pod.spec.init_containers)
        .any(|c| declares(&c.resources.requests) || declares(&c.resources.limits))
}

pub fn pod_matches_scope(
    selector: &ScopedResourceSelectorRequirement,
    object: &QuotaObject,
) -> Result<bool> {
    let pod = object.as_pod()?;
    match selector.scope_name {
        ResourceQuotaScope::Terminating => Ok(is_terminating(pod)),
        ResourceQuotaScope::NotTerminating => Ok(!is_terminating(pod)),
        ResourceQuotaScope::BestEffort => Ok(is_best_effort(pod)),
        ResourceQuotaScope::NotBestEffort => Ok(!is_best_effort(pod)),
        ResourceQuotaScope::PriorityClass => pod_matches_priority_class(pod, selector),
    }
}

/// Evaluates the selector as a label requirement against the single label
/// `PriorityClass=<name>`, absent when the pod has no priority class.
fn pod_matches_priority_class(
    pod: &Pod,
    selector: &ScopedResourceSelectorRequirement,
) -> Result<bool> {
    let invalid = |message: &str| QuotaError::Selector {
        scope: selector.scope_name.to_string(),
        message: message.to_string(),
    };
    let label = pod
        .spec
        .priority_class_name
        .as_deref()
        .filter(|name| !name.is_empty());
    match selector.operator {
        ScopeSelectorOperator::In | ScopeSelectorOperator::NotIn if selector.values.is_empty() => {
            Err(invalid(&format!(
                "values for key {} must be non-empty",
                PRIORITY_CLASS_LABEL
            )))
        }
        ScopeSelectorOperator::Exists | ScopeSelectorOperator::DoesNotExist
            if !selector.values.is_empty() =>
        {
            Err(invalid(&format!(
                "values for key {} must be empty",
                PRIORITY_CLASS_LABEL
            )))
        }
        ScopeSelectorOperator::In => {
            Ok(label.is_some_and(|l| selector.values.iter().any(|v| v == l)))
        }
        ScopeSelectorOperator::NotIn => {
            Ok(!label.is_some_and(|l| selector.values.iter().any(|v| v == l)))
        }
        ScopeSelectorOperator::Exists => Ok(label.is_some()),
        ScopeSelectorOperator::DoesNotExist => Ok(label.is_none()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use chrono::{TimeZone, Utc};
    use pkg_types::pod::{PodPhase, PodSpec, ResourceRequirements};
    use pkg_types::quota::{ResourceQuotaSpec, SharedQuotaSpec, SharedQuotaStatus};
    use std::collections::HashMap;

    fn q(s: &str) -> Quantity {
        Quantity::parse(s).unwrap()
    }

    fn list(entries: &[(&str, &str)]) -> ResourceList {
        entries.iter().map(|(k, v)| (*k, q(v))).collect()
    }

    fn container(requests: &[(&str, &str)], limits: &[(&str, &str)]) -> ContainerSpec {
        ContainerSpec {
            name: "c".to_string(),
            image: "img".to_string(),
            command: vec![],
            args: vec![],
            env: HashMap::new(),
            resources: ResourceRequirements {
                requests: list(requests),
                limits: list(limits),
            },
        }
    }

    fn pod(containers: Vec<ContainerSpec>, init: Vec<ContainerSpec>) -> Pod {
        Pod {
            name: "p".to_string(),
            namespace: "ns".to_string(),
            uid: "uid".to_string(),
            labels: HashMap::new(),
            spec: PodSpec {
                containers,
                init_containers: init,
                ..Default::default()
            },
            phase: PodPhase::Running,
            deletion_timestamp: None,
            deletion_grace_period_seconds: None,
            created_at: Utc::now(),
        }
    }

    fn clock() -> FakeClock {
        FakeClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap())
    }

    async fn evaluator() -> PodEvaluator {
        let store = StateStore::in_memory().await.unwrap();
        PodEvaluator::new(store, Arc::new(clock()))
    }

    fn quota_with(hard: &[(&str, &str)], spec: ResourceQuotaSpec) -> SharedQuota {
        let mut status = SharedQuotaStatus::default();
        status.total.hard = list(hard);
        SharedQuota {
            name: "q".to_string(),
            uid: "u".to_string(),
            resource_version: 1,
            spec: SharedQuotaSpec {
                selector: HashMap::from([("team".to_string(), "a".to_string())]),
                quota: spec,
            },
            status,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn init_containers_take_max_against_summed_containers() {
        let p = pod(
            vec![
                container(&[("cpu", "1"), ("memory", "1Gi")], &[("cpu", "2")]),
                container(&[("cpu", "500m"), ("memory", "1Gi")], &[]),
            ],
            vec![container(&[("cpu", "2"), ("memory", "1Gi")], &[("cpu", "1")])],
        );
        let usage = pod_usage(&p, &clock());
        assert_eq!(usage.get("count/pods"), Some(q("1")));
        assert_eq!(usage.get("pods"), Some(q("1")));
        assert_eq!(usage.get("cpu"), Some(q("2")));
        assert_eq!(usage.get("requests.cpu"), Some(q("2")));
        assert_eq!(usage.get("memory"), Some(q("2Gi")));
        assert_eq!(usage.get("limits.cpu"), Some(q("2")));
    }

    #[test]
    fn hugepages_counted_raw_and_prefixed_extended_only_prefixed() {
        let p = pod(
            vec![container(
                &[("hugepages-2Mi", "4Mi"), ("example.com/foo", "3")],
                &[],
            )],
            vec![],
        );
        let usage = pod_usage(&p, &clock());
        assert_eq!(usage.get("hugepages-2Mi"), Some(q("4Mi")));
        assert_eq!(usage.get("requests.hugepages-2Mi"), Some(q("4Mi")));
        assert_eq!(usage.get("requests.example.com/foo"), Some(q("3")));
        assert_eq!(usage.get("example.com/foo"), None);
    }

    #[test]
    fn gpu_counted_under_both_names() {
        let p = pod(vec![container(&[("nvidia.com/gpu", "2")], &[])], vec![]);
        let usage = pod_usage(&p, &clock());
        assert_eq!(usage.get("nvidia.com/gpu"), Some(q("2")));
        assert_eq!(usage.get("requests.nvidia.com/gpu"), Some(q("2")));
    }

    #[test]
    fn terminal_pod_only_counts_object() {
        let mut p = pod(vec![container(&[("cpu", "1")], &[])], vec![]);
        p.phase = PodPhase::Succeeded;
        let usage = pod_usage(&p, &clock());
        assert_eq!(usage, list(&[("count/pods", "1")]));
    }

    #[test]
    fn deletion_grace_period_gates_compute_usage() {
        let c = clock();
        let mut p = pod(vec![container(&[("cpu", "1")], &[])], vec![]);
        p.deletion_timestamp = Some(c.now());
        p.deletion_grace_period_seconds = Some(30);

        c.step(Duration::seconds(30));
        assert!(is_charged(&p, &c));
        assert_eq!(pod_usage(&p, &c).get("cpu"), Some(q("1")));

        c.step(Duration::seconds(1));
        assert!(!is_charged(&p, &c));
        assert_eq!(pod_usage(&p, &c), list(&[("count/pods", "1")]));
    }

    #[tokio::test]
    async fn constraints_name_every_missing_legacy_resource() {
        let e = evaluator().await;
        let p = QuotaObject::Pod(pod(
            vec![container(&[("cpu", "1")], &[])],
            vec![container(&[], &[("memory", "1Gi")])],
        ));
        let required = vec![
            "memory".to_string(),
            "cpu".to_string(),
            "ephemeral-storage".to_string(),
        ];
        match e.constraints(&required, &p) {
            Err(QuotaError::Constraint { missing }) => {
                assert_eq!(missing, vec!["cpu".to_string(), "memory".to_string()])
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn ephemeral_storage_is_never_required() {
        let e = evaluator().await;
        let p = QuotaObject::Pod(pod(vec![container(&[], &[])], vec![]));
        assert!(
            e.constraints(&["ephemeral-storage".to_string()], &p)
                .is_ok()
        );
        let err = e.constraints(&["memory".to_string()], &p).unwrap_err();
        assert_eq!(err.to_string(), "must specify memory");
    }

    #[tokio::test]
    async fn matching_resources_includes_prefixes_and_extended() {
        let e = evaluator().await;
        let input: Vec<String> = [
            "pods",
            "requests.hugepages-1Gi",
            "requests.example.com/foo",
            "example.com/foo",
            "services",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let mut matched = e.matching_resources(&input);
        matched.sort();
        assert_eq!(
            matched,
            vec!["pods", "requests.example.com/foo", "requests.hugepages-1Gi"]
        );
    }

    #[tokio::test]
    async fn scoped_quota_matches_only_best_effort_pods() {
        let e = evaluator().await;
        let quota = quota_with(
            &[("pods", "10")],
            ResourceQuotaSpec {
                scopes: vec![ResourceQuotaScope::BestEffort],
                ..Default::default()
            },
        );
        let best_effort = QuotaObject::Pod(pod(vec![container(&[], &[])], vec![]));
        let burstable = QuotaObject::Pod(pod(vec![container(&[("cpu", "1")], &[])], vec![]));
        assert!(e.matches(&quota, &best_effort).unwrap());
        assert!(!e.matches(&quota, &burstable).unwrap());

        let untracked = quota_with(&[("services", "1")], ResourceQuotaSpec::default());
        assert!(!e.matches(&untracked, &best_effort).unwrap());
    }

    #[test]
    fn zero_requests_are_still_best_effort() {
        let p = pod(vec![container(&[("cpu", "0")], &[])], vec![]);
        assert!(is_best_effort(&p));
        let p = pod(vec![container(&[("ephemeral-storage", "1Gi")], &[])], vec![]);
        assert!(is_best_effort(&p));
    }

    #[test]
    fn priority_class_selector() {
        let mut p = pod(vec![], vec![]);
        p.spec.priority_class_name = Some("high".to_string());
        let obj = QuotaObject::Pod(p);
        let req = |operator, values: &[&str]| ScopedResourceSelectorRequirement {
            scope_name: ResourceQuotaScope::PriorityClass,
            operator,
            values: values.iter().map(|v| v.to_string()).collect(),
        };

        assert!(pod_matches_scope(&req(ScopeSelectorOperator::In, &["high"]), &obj).unwrap());
        assert!(!pod_matches_scope(&req(ScopeSelectorOperator::NotIn, &["high"]), &obj).unwrap());
        assert!(pod_matches_scope(&req(ScopeSelectorOperator::Exists, &[]), &obj).unwrap());
        assert!(pod_matches_scope(&req(ScopeSelectorOperator::In, &[]), &obj).is_err());
        assert!(pod_matches_scope(&req(ScopeSelectorOperator::Exists, &["x"]), &obj).is_err());

        let plain = QuotaObject::Pod(pod(vec![], vec![]));
        assert!(pod_matches_scope(&req(ScopeSelectorOperator::NotIn, &["high"]), &plain).unwrap());
        assert!(
            pod_matches_scope(&req(ScopeSelectorOperator::DoesNotExist, &[]), &plain).unwrap()
        );
    }

    #[test]
    fn terminating_scope_follows_active_deadline() {
        let mut p = pod(vec![], vec![]);
        assert!(!is_terminating(&p));
        p.spec.active_deadline_seconds = Some(0);
        assert!(is_terminating(&p));
    }

    #[tokio::test]
    async fn usage_stats_sums_matching_pods_in_namespace() {
        let store = StateStore::in_memory().await.unwrap();
        let e = PodEvaluator::new(store.clone(), Arc::new(clock()));
        for (name, ns, cpu) in [("a", "ns", "1"), ("b", "ns", "2"), ("c", "other", "4")] {
            let mut p = pod(vec![container(&[("cpu", cpu)], &[])], vec![]);
            p.name = name.to_string();
            p.namespace = ns.to_string();
            store
                .put(
                    &format!("{}{}/{}", PODS_PREFIX, ns, name),
                    &serde_json::to_vec(&p).unwrap(),
                )
                .await
                .unwrap();
        }
        let stats = e
            .usage_stats(&UsageStatsOptions {
                namespace: "ns".to_string(),
                scope_selectors: vec![],
                resources: vec!["cpu".to_string(), "limits.memory".to_string()],
            })
            .await
            .unwrap();
        assert_eq!(stats.used.get("cpu"), Some(q("3")));
        assert_eq!(stats.used.get("pods"), Some(q("2")));
        assert_eq!(stats.used.get("limits.memory"), Some(Quantity::ZERO));
    }
}
