pub mod admission;
pub mod health;
pub mod namespaces;
pub mod quotas;
pub mod watch;
pub mod workloads;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use pkg_quota::QuotaError;
use tracing::warn;

/// Map an accessor error onto a plain-text HTTP error.
pub(crate) fn quota_error_response(context: &str, err: QuotaError) -> Response {
    let status = match &err {
        QuotaError::Conflict(_) => StatusCode::CONFLICT,
        QuotaError::NotFound(_) => StatusCode::NOT_FOUND,
        QuotaError::Decode { .. }
        | QuotaError::UnexpectedObject { .. }
        | QuotaError::Constraint { .. }
        | QuotaError::Selector { .. } => StatusCode::BAD_REQUEST,
        QuotaError::Store(_) => {
            warn!("{}: {}", context, err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string()).into_response()
}

pub(crate) fn store_error_response(context: &str, err: anyhow::Error) -> Response {
    warn!("{}: {}", context, err);
    (StatusCode::INTERNAL_SERVER_ERROR, context.to_string()).into_response()
}
