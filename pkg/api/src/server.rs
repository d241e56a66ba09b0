use axum::{
    Router, middleware,
    routing::{get, post, put},
};
use chrono::Utc;
use pkg_admission::evaluator::QuotaEvaluator;
use pkg_constants::network::WEBHOOK_PATH;
use pkg_controllers::sharedquota::SharedQuotaController;
use pkg_metrics::MetricsRegistry;
use pkg_quota::accessor::{SharedQuotaClient, namespace_key};
use pkg_quota::clock::{Clock, RealClock};
use pkg_quota::registry::Registry;
use pkg_state::client::StateStore;
use pkg_state::locks::LockFactory;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

use crate::AppState;
use crate::handlers::{admission, health, namespaces, quotas, watch, workloads};
use crate::request_id::request_id_middleware;

/// Server configuration passed from the binary's CLI.
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub data_dir: String,
    pub resync_period: Duration,
    pub max_concurrent_reconciles: usize,
    pub admission_workers: usize,
    pub admission_timeout: Duration,
}

/// All routes, bound to `state`.
pub fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        // namespaces
        .route(
            "/api/v1/namespaces",
            post(namespaces::create_namespace).get(namespaces::list_namespaces),
        )
        .route(
            "/api/v1/namespaces/{name}",
            put(namespaces::update_namespace_labels),
        )
        // shared quotas
        .route(
            "/api/v1/sharedquotas",
            post(quotas::create_quota).get(quotas::list_quotas),
        )
        .route(
            "/api/v1/sharedquotas/{name}",
            get(quotas::get_quota)
                .put(quotas::update_quota)
                .delete(quotas::delete_quota),
        )
        // pods, services, persistentvolumeclaims
        .route(
            "/api/v1/namespaces/{ns}/{resource}",
            post(workloads::create_workload).get(workloads::list_workloads),
        )
        .route(
            "/api/v1/namespaces/{ns}/{resource}/{name}",
            put(workloads::update_workload).delete(workloads::delete_workload),
        )
        .route("/api/v1/watch", get(watch::watch_events))
        .route(WEBHOOK_PATH, post(admission::validate))
        .layer(middleware::from_fn(request_id_middleware));

    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/metrics", get(health::metrics))
        .merge(api_routes)
        .with_state(state)
}

pub async fn start_server(config: ServerConfig) -> anyhow::Result<()> {
    let store = StateStore::new(&config.data_dir).await?;
    seed_default_namespace(&store).await?;

    let clock: Arc<dyn Clock> = Arc::new(RealClock);
    let registry = Arc::new(Registry::with_defaults(store.clone(), clock.clone()));
    let metrics = Arc::new(MetricsRegistry::with_quota_metrics());
    let quotas = SharedQuotaClient::new(store.clone());

    let controller = Arc::new(SharedQuotaController::new(
        store.clone(),
        registry.clone(),
        clock,
        metrics.clone(),
        config.resync_period,
        config.max_concurrent_reconciles,
    ));
    let queue = controller.queue();
    controller.start();

    let admission = Arc::new(QuotaEvaluator::new(
        quotas.clone(),
        registry,
        config.admission_workers,
        config.admission_timeout,
    ));

    let state = AppState {
        store: store.clone(),
        quotas,
        admission,
        metrics,
        object_locks: Arc::new(LockFactory::new()),
    };

    info!("Starting API server on {}", config.addr);
    let listener = TcpListener::bind(config.addr).await?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    queue.shut_down();
    store.close().await?;
    Ok(())
}

/// Seed the unlabelled `default` namespace on startup.
async fn seed_default_namespace(store: &StateStore) -> anyhow::Result<()> {
    let key = namespace_key("default");
    if store.get(&key).await?.is_none() {
        let ns = pkg_types::namespace::Namespace {
            name: "default".to_string(),
            labels: std::collections::HashMap::new(),
            created_at: Utc::now(),
        };
        store.put(&key, &serde_json::to_vec(&ns)?).await?;
        info!("Seeded namespace: default");
    }
    Ok(())
}
