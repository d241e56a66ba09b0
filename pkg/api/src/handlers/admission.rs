use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use pkg_admission::AdmissionError;
use pkg_admission::attributes::Attributes;
use pkg_metrics::{ADMISSION_ALLOWED, ADMISSION_DENIED, ADMISSION_ERRORS};
use pkg_types::admission::{AdmissionResponse, AdmissionReview};
use tracing::{info, warn};

use crate::AppState;

/// Run the shared-quota gate and count the outcome.
pub(crate) async fn admit(state: &AppState, attrs: &Attributes) -> Result<(), AdmissionError> {
    let result = state.admission.evaluate(attrs).await;
    match &result {
        Ok(()) => state.metrics.counter_inc(ADMISSION_ALLOWED),
        Err(e) if e.is_forbidden() => {
            info!(
                "Denied {} {}/{}: {}",
                attrs.resource, attrs.namespace, attrs.name, e
            );
            state.metrics.counter_inc(ADMISSION_DENIED);
        }
        Err(e) => {
            warn!(
                "Admission of {} {}/{} failed: {}",
                attrs.resource, attrs.namespace, attrs.name, e
            );
            state.metrics.counter_inc(ADMISSION_ERRORS);
        }
    }
    result
}

/// POST /validate-quota-v1: validating admission webhook.
///
/// Always answers 200 with a review; the verdict is in `response`.
pub async fn validate(
    State(state): State<AppState>,
    Json(review): Json<AdmissionReview>,
) -> impl IntoResponse {
    let Some(request) = review.request.as_ref() else {
        return (
            StatusCode::BAD_REQUEST,
            "admission review carries no request",
        )
            .into_response();
    };

    let response = match Attributes::from_request(request) {
        Ok(attrs) => match admit(&state, &attrs).await {
            Ok(()) => AdmissionResponse::allowed(&request.uid),
            Err(e) if e.is_forbidden() => AdmissionResponse::denied(&request.uid, e.to_string()),
            Err(e) => AdmissionResponse::errored(&request.uid, e.code(), e.to_string()),
        },
        Err(e) => {
            state.metrics.counter_inc(ADMISSION_ERRORS);
            AdmissionResponse::errored(&request.uid, e.code(), e.to_string())
        }
    };

    (StatusCode::OK, Json(review.respond(response))).into_response()
}
