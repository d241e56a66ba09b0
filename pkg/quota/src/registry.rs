use pkg_state::client::StateStore;
use std::sync::Arc;

use crate::Evaluator;
use crate::clock::Clock;
use crate::pods::PodEvaluator;
use crate::pvcs::PersistentVolumeClaimEvaluator;
use crate::services::ServiceEvaluator;

/// The evaluator set, fixed at construction.
#[derive(Clone)]
pub struct Registry {
    evaluators: Vec<Arc<dyn Evaluator>>,
}

impl Registry {
    pub fn new(evaluators: Vec<Arc<dyn Evaluator>>) -> Self {
        Self { evaluators }
    }

    /// Pods, services and persistent volume claims, reading from `store`.
    pub fn with_defaults(store: StateStore, clock: Arc<dyn Clock>) -> Self {
        Self::new(vec![
            Arc::new(PodEvaluator::new(store.clone(), clock)),
            Arc::new(ServiceEvaluator::new(store.clone())),
            Arc::new(PersistentVolumeClaimEvaluator::new(store)),
        ])
    }

    pub fn list(&self) -> &[Arc<dyn Evaluator>] {
        &self.evaluators
    }

    /// The evaluator for a plural resource name such as `pods`.
    pub fn get(&self, resource: &str) -> Option<Arc<dyn Evaluator>> {
        self.evaluators
            .iter()
            .find(|e| e.group_resource() == resource)
            .cloned()
    }

    /// Whether any evaluator is responsible for one of `resources`.
    pub fn tracks_any(&self, resources: &[String]) -> bool {
        self.evaluators
            .iter()
            .any(|e| !e.matching_resources(resources).is_empty())
    }
}
