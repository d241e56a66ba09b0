use axum::{
    Json,
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::IntoResponse,
};
use pkg_types::quota::SharedQuotaSpec;
use pkg_types::validate::{validate_name, validate_resource_name};
use serde::Deserialize;
use tracing::info;

use super::quota_error_response;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSharedQuota {
    pub name: String,
    pub spec: SharedQuotaSpec,
}

fn validate_spec(spec: &SharedQuotaSpec) -> anyhow::Result<()> {
    for name in spec.quota.hard.names() {
        validate_resource_name(&name)?;
    }
    Ok(())
}

/// POST /api/v1/sharedquotas
pub async fn create_quota(
    State(state): State<AppState>,
    Json(body): Json<CreateSharedQuota>,
) -> impl IntoResponse {
    if let Err(e) = validate_name(&body.name).and_then(|_| validate_spec(&body.spec)) {
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }
    match state.quotas.create(&body.name, body.spec).await {
        Ok(quota) => {
            info!(
                "Created shared quota {} (selector={:?}, hard={})",
                quota.name, quota.spec.selector, quota.spec.quota.hard
            );
            (StatusCode::CREATED, Json(quota)).into_response()
        }
        Err(e) => quota_error_response("Failed to create shared quota", e),
    }
}

/// GET /api/v1/sharedquotas
pub async fn list_quotas(State(state): State<AppState>) -> impl IntoResponse {
    match state.quotas.list().await {
        Ok(quotas) => (StatusCode::OK, Json(quotas)).into_response(),
        Err(e) => quota_error_response("Failed to list shared quotas", e),
    }
}

/// GET /api/v1/sharedquotas/{name}
pub async fn get_quota(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
) -> impl IntoResponse {
    match state.quotas.get(&name).await {
        Ok(Some(quota)) => (StatusCode::OK, Json(quota)).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => quota_error_response("Failed to read shared quota", e),
    }
}

/// PUT /api/v1/sharedquotas/{name}: replace the spec. Status is owned by
/// the reconciler and admission and cannot be written here.
pub async fn update_quota(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
    Json(spec): Json<SharedQuotaSpec>,
) -> impl IntoResponse {
    if let Err(e) = validate_spec(&spec) {
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }
    match state.quotas.update_spec(&name, spec).await {
        Ok(quota) => {
            info!("Updated shared quota {} spec", name);
            (StatusCode::OK, Json(quota)).into_response()
        }
        Err(e) => quota_error_response("Failed to update shared quota", e),
    }
}

/// DELETE /api/v1/sharedquotas/{name}
pub async fn delete_quota(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
) -> impl IntoResponse {
    match state.quotas.delete(&name).await {
        Ok(true) => {
            info!("Deleted shared quota {}", name);
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => quota_error_response("Failed to delete shared quota", e),
    }
}
