use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::resource::ResourceList;

/// Predicate names a quota can restrict itself to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceQuotaScope {
    /// Pods with an active deadline.
    Terminating,
    NotTerminating,
    /// Pods that declare no compute requests or limits.
    BestEffort,
    NotBestEffort,
    /// Matched through a selector over the pod's priority class name.
    PriorityClass,
}

impl std::fmt::Display for ResourceQuotaScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceQuotaScope::Terminating => write!(f, "Terminating"),
            ResourceQuotaScope::NotTerminating => write!(f, "NotTerminating"),
            ResourceQuotaScope::BestEffort => write!(f, "BestEffort"),
            ResourceQuotaScope::NotBestEffort => write!(f, "NotBestEffort"),
            ResourceQuotaScope::PriorityClass => write!(f, "PriorityClass"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScopeSelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopedResourceSelectorRequirement {
    pub scope_name: ResourceQuotaScope,
    pub operator: ScopeSelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

impl ScopedResourceSelectorRequirement {
    /// The requirement a bare scope in `scopes` stands for.
    pub fn exists(scope_name: ResourceQuotaScope) -> Self {
        Self {
            scope_name,
            operator: ScopeSelectorOperator::Exists,
            values: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeSelector {
    #[serde(default)]
    pub match_expressions: Vec<ScopedResourceSelectorRequirement>,
}

/// Hard limits plus the scopes restricting which objects count.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuotaSpec {
    #[serde(default)]
    pub hard: ResourceList,
    #[serde(default)]
    pub scopes: Vec<ResourceQuotaScope>,
    #[serde(default)]
    pub scope_selector: Option<ScopeSelector>,
}

impl ResourceQuotaSpec {
    /// Bare scopes as `Exists` requirements, followed by the selector's
    /// expressions. An object counts only if it satisfies all of them.
    pub fn scope_selectors(&self) -> Vec<ScopedResourceSelectorRequirement> {
        let mut selectors: Vec<_> = self
            .scopes
            .iter()
            .map(|s| ScopedResourceSelectorRequirement::exists(*s))
            .collect();
        if let Some(selector) = &self.scope_selector {
            selectors.extend(selector.match_expressions.iter().cloned());
        }
        selectors
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuotaStatus {
    #[serde(default)]
    pub hard: ResourceList,
    #[serde(default)]
    pub used: ResourceList,
}

/// Usage contributed by one member namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceQuotaStatus {
    pub namespace: String,
    #[serde(flatten)]
    pub status: ResourceQuotaStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedQuotaSpec {
    /// Namespaces carrying all of these labels are members.
    #[serde(default)]
    pub selector: HashMap<String, String>,
    pub quota: ResourceQuotaSpec,
}

impl SharedQuotaSpec {
    /// An empty selector selects nothing.
    pub fn selects(&self, labels: &HashMap<String, String>) -> bool {
        !self.selector.is_empty()
            && self
                .selector
                .iter()
                .all(|(k, v)| labels.get(k).is_some_and(|lv| lv == v))
    }
}

/// Observed usage: cluster-wide total plus the per-namespace breakdown the
/// total was folded from. The breakdown keeps insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedQuotaStatus {
    #[serde(default)]
    pub total: ResourceQuotaStatus,
    #[serde(default)]
    pub namespaces: Vec<NamespaceQuotaStatus>,
}

impl SharedQuotaStatus {
    pub fn namespace_status(&self, namespace: &str) -> Option<&ResourceQuotaStatus> {
        self.namespaces
            .iter()
            .find(|n| n.namespace == namespace)
            .map(|n| &n.status)
    }

    /// Replace the entry in place, or append it if the namespace is new.
    pub fn upsert_namespace(&mut self, namespace: &str, status: ResourceQuotaStatus) {
        match self.namespaces.iter_mut().find(|n| n.namespace == namespace) {
            Some(entry) => entry.status = status,
            None => self.namespaces.push(NamespaceQuotaStatus {
                namespace: namespace.to_string(),
                status,
            }),
        }
    }

    pub fn remove_namespace(&mut self, namespace: &str) -> Option<ResourceQuotaStatus> {
        let idx = self.namespaces.iter().position(|n| n.namespace == namespace)?;
        Some(self.namespaces.remove(idx).status)
    }
}

/// A quota enforced across every namespace its selector matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedQuota {
    pub name: String,
    /// Stable identity; admission locks are keyed by it.
    #[serde(default)]
    pub uid: String,
    /// Bumped on every write; status updates compare against it.
    #[serde(default)]
    pub resource_version: u64,
    pub spec: SharedQuotaSpec,
    #[serde(default)]
    pub status: SharedQuotaStatus,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Quantity;

    fn status(pods: u64) -> ResourceQuotaStatus {
        ResourceQuotaStatus {
            hard: ResourceList::new(),
            used: [("pods", Quantity::from_units(pods))].into_iter().collect(),
        }
    }

    #[test]
    fn upsert_preserves_order() {
        let mut st = SharedQuotaStatus::default();
        st.upsert_namespace("a", status(1));
        st.upsert_namespace("b", status(2));
        st.upsert_namespace("c", status(3));
        st.upsert_namespace("a", status(9));

        let order: Vec<_> = st.namespaces.iter().map(|n| n.namespace.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(st.namespace_status("a"), Some(&status(9)));
    }

    #[test]
    fn remove_keeps_remaining_order() {
        let mut st = SharedQuotaStatus::default();
        for (i, ns) in ["a", "b", "c"].iter().enumerate() {
            st.upsert_namespace(ns, status(i as u64));
        }
        assert_eq!(st.remove_namespace("b"), Some(status(1)));
        assert_eq!(st.remove_namespace("zzz"), None);
        let order: Vec<_> = st.namespaces.iter().map(|n| n.namespace.as_str()).collect();
        assert_eq!(order, vec!["a", "c"]);
    }

    #[test]
    fn selector_matching() {
        let spec = SharedQuotaSpec {
            selector: HashMap::from([("team".to_string(), "a".to_string())]),
            quota: ResourceQuotaSpec::default(),
        };
        let mut labels = HashMap::from([("team".to_string(), "a".to_string())]);
        assert!(spec.selects(&labels));
        labels.insert("team".to_string(), "b".to_string());
        assert!(!spec.selects(&labels));

        let empty = SharedQuotaSpec::default();
        assert!(!empty.selects(&labels));
    }

    #[test]
    fn scope_selectors_merge_scopes_and_expressions() {
        let spec = ResourceQuotaSpec {
            hard: ResourceList::new(),
            scopes: vec![ResourceQuotaScope::BestEffort],
            scope_selector: Some(ScopeSelector {
                match_expressions: vec![ScopedResourceSelectorRequirement {
                    scope_name: ResourceQuotaScope::PriorityClass,
                    operator: ScopeSelectorOperator::In,
                    values: vec!["high".to_string()],
                }],
            }),
        };
        let selectors = spec.scope_selectors();
        assert_eq!(selectors.len(), 2);
        assert_eq!(selectors[0].operator, ScopeSelectorOperator::Exists);
        assert_eq!(selectors[1].scope_name, ResourceQuotaScope::PriorityClass);
    }

    #[test]
    fn status_serializes_flattened_breakdown() {
        let mut st = SharedQuotaStatus::default();
        st.upsert_namespace("a", status(1));
        let json = serde_json::to_value(&st).unwrap();
        assert_eq!(json["namespaces"][0]["namespace"], "a");
        assert_eq!(json["namespaces"][0]["used"]["pods"], "1");
    }
}
