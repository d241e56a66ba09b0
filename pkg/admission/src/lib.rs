//! The shared-quota admission gate.
//!
//! [`evaluator::QuotaEvaluator`] decides whether a create or update fits in
//! every shared quota covering the request's namespace, and records the new
//! usage before answering.

pub mod attributes;
pub mod evaluator;

use pkg_quota::QuotaError;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    /// The request is rejected: a quota would be exceeded or the object
    /// fails a quota's constraints.
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
    #[error("quota evaluation timed out after {0:?}")]
    Timeout(Duration),
}

impl AdmissionError {
    /// HTTP-style status carried in the admission response.
    pub fn code(&self) -> u16 {
        match self {
            AdmissionError::Forbidden(_) => 403,
            AdmissionError::BadRequest(_) => 400,
            AdmissionError::Internal(_) | AdmissionError::Timeout(_) => 500,
        }
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self, AdmissionError::Forbidden(_))
    }
}

impl From<QuotaError> for AdmissionError {
    fn from(err: QuotaError) -> Self {
        match err {
            QuotaError::Decode { .. } | QuotaError::UnexpectedObject { .. } => {
                AdmissionError::BadRequest(err.to_string())
            }
            QuotaError::Constraint { .. } | QuotaError::Selector { .. } => {
                AdmissionError::Forbidden(err.to_string())
            }
            QuotaError::Conflict(_) | QuotaError::NotFound(_) | QuotaError::Store(_) => {
                AdmissionError::Internal(err.to_string())
            }
        }
    }
}
