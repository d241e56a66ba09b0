use axum::{
    Json,
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use pkg_quota::accessor::namespace_key;
use pkg_types::namespace::Namespace;
use pkg_types::validate::{is_qualified_name, validate_name};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::info;

use super::{quota_error_response, store_error_response};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct NamespaceLabels {
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

fn validate_labels(labels: &HashMap<String, String>) -> Result<(), String> {
    match labels.keys().find(|k| !is_qualified_name(k)) {
        Some(bad) => Err(format!("label key '{}' is not a valid qualified name", bad)),
        None => Ok(()),
    }
}

async fn write_namespace(state: &AppState, ns: &Namespace) -> anyhow::Result<()> {
    let data = serde_json::to_vec(ns)?;
    state.store.put(&namespace_key(&ns.name), &data).await
}

/// POST /api/v1/namespaces
pub async fn create_namespace(
    State(state): State<AppState>,
    Json(mut ns): Json<Namespace>,
) -> impl IntoResponse {
    if let Err(e) = validate_name(&ns.name) {
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }
    if let Err(msg) = validate_labels(&ns.labels) {
        return (StatusCode::BAD_REQUEST, msg).into_response();
    }
    match state.quotas.get_namespace(&ns.name).await {
        Ok(Some(_)) => {
            return (
                StatusCode::CONFLICT,
                format!("namespace {} already exists", ns.name),
            )
                .into_response();
        }
        Ok(None) => {}
        Err(e) => return quota_error_response("Failed to read namespace", e),
    }

    ns.created_at = Utc::now();
    if let Err(e) = write_namespace(&state, &ns).await {
        return store_error_response("Failed to create namespace", e);
    }
    info!("Created namespace {} (labels={:?})", ns.name, ns.labels);
    (StatusCode::CREATED, Json(ns)).into_response()
}

/// PUT /api/v1/namespaces/{name}: replace the label set.
pub async fn update_namespace_labels(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
    Json(body): Json<NamespaceLabels>,
) -> impl IntoResponse {
    if let Err(msg) = validate_labels(&body.labels) {
        return (StatusCode::BAD_REQUEST, msg).into_response();
    }
    let mut ns = match state.quotas.get_namespace(&name).await {
        Ok(Some(ns)) => ns,
        Ok(None) => {
            return (StatusCode::NOT_FOUND, format!("namespace {} not found", name))
                .into_response();
        }
        Err(e) => return quota_error_response("Failed to read namespace", e),
    };

    ns.labels = body.labels;
    if let Err(e) = write_namespace(&state, &ns).await {
        return store_error_response("Failed to update namespace", e);
    }
    info!("Relabelled namespace {} (labels={:?})", ns.name, ns.labels);
    (StatusCode::OK, Json(ns)).into_response()
}

/// GET /api/v1/namespaces
pub async fn list_namespaces(State(state): State<AppState>) -> impl IntoResponse {
    match state.quotas.list_namespaces().await {
        Ok(namespaces) => (StatusCode::OK, Json(namespaces)).into_response(),
        Err(e) => quota_error_response("Failed to list namespaces", e),
    }
}
