pub mod handlers;
pub mod request_id;
pub mod server;

use std::sync::Arc;

use pkg_admission::evaluator::QuotaEvaluator;
use pkg_metrics::MetricsRegistry;
use pkg_quota::accessor::SharedQuotaClient;
use pkg_state::client::StateStore;
use pkg_state::locks::LockFactory;

/// Shared application state injected into all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: StateStore,
    pub quotas: SharedQuotaClient,
    pub admission: Arc<QuotaEvaluator>,
    pub metrics: Arc<MetricsRegistry>,
    /// Serializes writes to one workload key across handlers.
    pub object_locks: Arc<LockFactory>,
}
