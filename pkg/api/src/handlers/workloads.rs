//! Pods, services and persistent volume claims.
//!
//! Creates and updates go through the shared-quota gate before the object is
//! stored; a denial leaves the store untouched. Writes to one key are
//! serialized, and the store write itself is conditional on the object the
//! handler saw.

use axum::{
    Json,
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use pkg_admission::attributes::Attributes;
use pkg_constants::state::{PODS_PREFIX, PVCS_PREFIX, SERVICES_PREFIX};
use pkg_quota::object::{PERSISTENT_VOLUME_CLAIMS, PODS, QuotaObject, SERVICES};
use pkg_state::client::CasEntry;
use pkg_types::admission::Operation;
use pkg_types::pod::{ContainerSpec, ResourceRequirements};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use super::{admission::admit, store_error_response};
use crate::AppState;

fn prefix_for(resource: &str) -> Option<&'static str> {
    match resource {
        PODS => Some(PODS_PREFIX),
        SERVICES => Some(SERVICES_PREFIX),
        PERSISTENT_VOLUME_CLAIMS => Some(PVCS_PREFIX),
        _ => None,
    }
}

fn unknown_resource(resource: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        format!("unknown resource type {}", resource),
    )
        .into_response()
}

/// Stamp the path's namespace (and optionally name/uid) onto a request body.
fn stamp(mut value: Value, namespace: &str, name: Option<&str>, uid: Option<Value>) -> Value {
    if let Some(obj) = value.as_object_mut() {
        obj.insert("namespace".to_string(), Value::from(namespace));
        if let Some(name) = name {
            obj.insert("name".to_string(), Value::from(name));
        }
        let uid = uid
            .filter(|u| u.as_str().is_some_and(|s| !s.is_empty()))
            .unwrap_or_else(|| Value::from(Uuid::new_v4().to_string()));
        obj.insert("uid".to_string(), uid);
    }
    value
}

fn decode(resource: &str, value: Value) -> Result<QuotaObject, Response> {
    match QuotaObject::decode(resource, value) {
        Ok(Some(object)) => Ok(object),
        Ok(None) => Err(unknown_resource(resource)),
        Err(e) => Err((StatusCode::BAD_REQUEST, e.to_string()).into_response()),
    }
}

fn container_resources(containers: &[ContainerSpec]) -> Vec<&ResourceRequirements> {
    containers.iter().map(|c| &c.resources).collect()
}

/// Pod usage is charged once, at creation; the containers' requests and
/// limits are fixed from then on.
fn pod_resources_changed(old: &QuotaObject, new: &QuotaObject) -> bool {
    match (old, new) {
        (QuotaObject::Pod(old), QuotaObject::Pod(new)) => {
            container_resources(&old.spec.containers) != container_resources(&new.spec.containers)
                || container_resources(&old.spec.init_containers)
                    != container_resources(&new.spec.init_containers)
        }
        _ => false,
    }
}

fn conflict(attrs: &Attributes, what: &str) -> Response {
    (
        StatusCode::CONFLICT,
        format!(
            "{} {}/{} {}",
            attrs.resource, attrs.namespace, attrs.name, what
        ),
    )
        .into_response()
}

/// Admit, then store only if `key` still holds `expected` (`None` = absent).
/// Callers hold the key's object lock.
async fn admit_and_store(
    state: &AppState,
    key: &str,
    attrs: &Attributes,
    object: &QuotaObject,
    expected: Option<Vec<u8>>,
    created: StatusCode,
) -> Response {
    if let Err(e) = admit(state, attrs).await {
        let status = StatusCode::from_u16(e.code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return (status, e.to_string()).into_response();
    }
    let data = match object.to_json() {
        Ok(data) => data,
        Err(_) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, "Serialization failed").into_response();
        }
    };
    let entry = CasEntry {
        key: key.to_string(),
        expected,
        value: data.clone(),
    };
    // A charge whose write fails or loses the race is released by the
    // next reconcile of the affected quotas.
    match state.store.compare_and_put(&[entry]).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(
                "{} {}/{} changed while it was being admitted",
                attrs.resource, attrs.namespace, attrs.name
            );
            return conflict(attrs, "was modified concurrently");
        }
        Err(e) => return store_error_response("Failed to store object", e),
    }
    info!(
        "Stored {} {}/{} ({:?})",
        attrs.resource, attrs.namespace, attrs.name, attrs.operation
    );
    (created, Json(serde_json::from_slice::<Value>(&data).unwrap_or_default())).into_response()
}

/// POST /api/v1/namespaces/{ns}/{resource}
pub async fn create_workload(
    State(state): State<AppState>,
    AxumPath((ns, resource)): AxumPath<(String, String)>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let Some(prefix) = prefix_for(&resource) else {
        return unknown_resource(&resource);
    };
    match state.quotas.get_namespace(&ns).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return (StatusCode::NOT_FOUND, format!("namespace {} not found", ns)).into_response();
        }
        Err(e) => return super::quota_error_response("Failed to read namespace", e),
    }
    let object = match decode(&resource, stamp(body, &ns, None, None)) {
        Ok(object) => object,
        Err(response) => return response,
    };
    let key = format!("{}{}/{}", prefix, ns, object.name());
    let attrs = Attributes::new(&ns, Operation::Create, object.clone());

    // Only one create per name reaches admission; the loser is refused
    // before it is charged.
    let _guard = state.object_locks.acquire_ordered([key.as_str()]).await;
    match state.store.get(&key).await {
        Ok(Some(_)) => return conflict(&attrs, "already exists"),
        Ok(None) => {}
        Err(e) => return store_error_response("Failed to read object", e),
    }
    admit_and_store(&state, &key, &attrs, &object, None, StatusCode::CREATED).await
}

/// PUT /api/v1/namespaces/{ns}/{resource}/{name}
pub async fn update_workload(
    State(state): State<AppState>,
    AxumPath((ns, resource, name)): AxumPath<(String, String, String)>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let Some(prefix) = prefix_for(&resource) else {
        return unknown_resource(&resource);
    };
    let key = format!("{}{}/{}", prefix, ns, name);
    let _guard = state.object_locks.acquire_ordered([key.as_str()]).await;
    let bytes = match state.store.get(&key).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => return store_error_response("Failed to read object", e),
    };
    let old = match QuotaObject::decode_slice(&resource, &bytes) {
        Ok(Some(old)) => old,
        Ok(None) => return unknown_resource(&resource),
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    let old_uid = serde_json::from_slice::<Value>(&bytes)
        .ok()
        .and_then(|v| v.get("uid").cloned());
    let object = match decode(&resource, stamp(body, &ns, Some(&name), old_uid)) {
        Ok(object) => object,
        Err(response) => return response,
    };
    if pod_resources_changed(&old, &object) {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            format!(
                "pod {}/{}: container resources are immutable; recreate the pod to change them",
                ns, name
            ),
        )
            .into_response();
    }

    let attrs = Attributes::new(&ns, Operation::Update, object.clone()).with_old_object(old);
    admit_and_store(&state, &key, &attrs, &object, Some(bytes), StatusCode::OK).await
}

/// GET /api/v1/namespaces/{ns}/{resource}
pub async fn list_workloads(
    State(state): State<AppState>,
    AxumPath((ns, resource)): AxumPath<(String, String)>,
) -> impl IntoResponse {
    let Some(prefix) = prefix_for(&resource) else {
        return unknown_resource(&resource);
    };
    let entries = match state.store.list_prefix(&format!("{}{}/", prefix, ns)).await {
        Ok(entries) => entries,
        Err(e) => return store_error_response("Failed to list objects", e),
    };
    let objects: Vec<Value> = entries
        .into_iter()
        .filter_map(|(_, v)| serde_json::from_slice(&v).ok())
        .collect();
    (StatusCode::OK, Json(objects)).into_response()
}

/// DELETE /api/v1/namespaces/{ns}/{resource}/{name}
///
/// Released usage is returned to the quotas by the reconciler.
pub async fn delete_workload(
    State(state): State<AppState>,
    AxumPath((ns, resource, name)): AxumPath<(String, String, String)>,
) -> impl IntoResponse {
    let Some(prefix) = prefix_for(&resource) else {
        return unknown_resource(&resource);
    };
    let key = format!("{}{}/{}", prefix, ns, name);
    let _guard = state.object_locks.acquire_ordered([key.as_str()]).await;
    match state.store.get(&key).await {
        Ok(Some(_)) => {}
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => return store_error_response("Failed to read object", e),
    }
    if let Err(e) = state.store.delete(&key).await {
        return store_error_response("Failed to delete object", e);
    }
    info!("Deleted {} {}/{}", resource, ns, name);
    StatusCode::NO_CONTENT.into_response()
}
