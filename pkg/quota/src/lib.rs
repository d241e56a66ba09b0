//! Usage evaluation for shared quotas.
//!
//! Each tracked workload kind has an [`Evaluator`] that knows which resource
//! names it is responsible for, how much a single object consumes and how to
//! sum usage over a namespace. The [`registry::Registry`] holds the evaluator
//! set built at startup and is shared by the admission gate and the
//! reconciler.

pub mod accessor;
pub mod clock;
pub mod generic;
pub mod object;
pub mod pods;
pub mod pvcs;
pub mod registry;
pub mod services;
pub mod usage;

use async_trait::async_trait;
use pkg_types::admission::Operation;
use pkg_types::quota::{ScopedResourceSelectorRequirement, SharedQuota};
use pkg_types::resource::ResourceList;

use crate::object::QuotaObject;

#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    /// The object omits resources a matching quota requires it to declare.
    #[error("must specify {}", missing.join(","))]
    Constraint { missing: Vec<String> },
    #[error("expected {expected}, got {found}")]
    UnexpectedObject {
        expected: &'static str,
        found: &'static str,
    },
    #[error("failed to decode {resource}: {source}")]
    Decode {
        resource: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("error on matching scope {scope}: {message}")]
    Selector { scope: String, message: String },
    #[error("shared quota {0} was modified concurrently")]
    Conflict(String),
    #[error("shared quota {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, QuotaError>;

/// Inputs to [`Evaluator::usage_stats`].
#[derive(Debug, Clone, Default)]
pub struct UsageStatsOptions {
    pub namespace: String,
    /// Bare scopes already folded in as `Exists` requirements.
    pub scope_selectors: Vec<ScopedResourceSelectorRequirement>,
    /// Resources reported even when nothing in the namespace uses them.
    pub resources: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageStats {
    pub used: ResourceList,
}

/// Usage policy for one workload kind.
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Plural resource name of the kind this evaluator governs, e.g. `pods`.
    fn group_resource(&self) -> &'static str;

    /// Validate that `object` declares what the `required` resources demand.
    fn constraints(&self, required: &[String], object: &QuotaObject) -> Result<()>;

    /// Whether this evaluator takes part in admission for `operation`.
    fn handles(&self, operation: Operation) -> bool;

    /// True if `object` is charged against `quota`: it tracks one of our
    /// resources and the object satisfies every scope the quota declares.
    fn matches(&self, quota: &SharedQuota, object: &QuotaObject) -> Result<bool>;

    /// The subset of `input` this evaluator is responsible for.
    fn matching_resources(&self, input: &[String]) -> Vec<String>;

    /// The selectors from `selectors` that `object` satisfies.
    fn matching_scopes(
        &self,
        object: &QuotaObject,
        selectors: &[ScopedResourceSelectorRequirement],
    ) -> Result<Vec<ScopedResourceSelectorRequirement>>;

    /// Usage of a single object. Pure.
    fn usage(&self, object: &QuotaObject) -> Result<ResourceList>;

    /// Summed usage of every live object of this kind in a namespace.
    async fn usage_stats(&self, options: &UsageStatsOptions) -> Result<UsageStats>;
}
