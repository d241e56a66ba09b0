use pkg_types::pod::Pod;
use pkg_types::service::Service;
use pkg_types::volume::PersistentVolumeClaim;

use crate::{QuotaError, Result};

pub const PODS: &str = "pods";
pub const SERVICES: &str = "services";
pub const PERSISTENT_VOLUME_CLAIMS: &str = "persistentvolumeclaims";

/// A workload object some evaluator can charge for.
#[derive(Debug, Clone, PartialEq)]
pub enum QuotaObject {
    Pod(Pod),
    Service(Service),
    PersistentVolumeClaim(PersistentVolumeClaim),
}

impl QuotaObject {
    /// Plural resource name, matching [`crate::Evaluator::group_resource`].
    pub fn resource(&self) -> &'static str {
        match self {
            QuotaObject::Pod(_) => PODS,
            QuotaObject::Service(_) => SERVICES,
            QuotaObject::PersistentVolumeClaim(_) => PERSISTENT_VOLUME_CLAIMS,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            QuotaObject::Pod(_) => "Pod",
            QuotaObject::Service(_) => "Service",
            QuotaObject::PersistentVolumeClaim(_) => "PersistentVolumeClaim",
        }
    }

    pub fn name(&self) -> &str {
        match self {
            QuotaObject::Pod(p) => &p.name,
            QuotaObject::Service(s) => &s.name,
            QuotaObject::PersistentVolumeClaim(c) => &c.name,
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            QuotaObject::Pod(p) => &p.namespace,
            QuotaObject::Service(s) => &s.namespace,
            QuotaObject::PersistentVolumeClaim(c) => &c.namespace,
        }
    }

    /// Decode a JSON payload for `resource`. Returns `None` for kinds no
    /// evaluator tracks.
    pub fn decode(resource: &str, value: serde_json::Value) -> Result<Option<Self>> {
        let decode_err = |source| QuotaError::Decode {
            resource: resource.to_string(),
            source,
        };
        let object = match resource {
            PODS => QuotaObject::Pod(serde_json::from_value(value).map_err(decode_err)?),
            SERVICES => QuotaObject::Service(serde_json::from_value(value).map_err(decode_err)?),
            PERSISTENT_VOLUME_CLAIMS => QuotaObject::PersistentVolumeClaim(
                serde_json::from_value(value).map_err(decode_err)?,
            ),
            _ => return Ok(None),
        };
        Ok(Some(object))
    }

    /// Same as [`QuotaObject::decode`] but from stored bytes.
    pub fn decode_slice(resource: &str, bytes: &[u8]) -> Result<Option<Self>> {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|source| QuotaError::Decode {
                resource: resource.to_string(),
                source,
            })?;
        Self::decode(resource, value)
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            QuotaObject::Pod(p) => serde_json::to_vec(p),
            QuotaObject::Service(s) => serde_json::to_vec(s),
            QuotaObject::PersistentVolumeClaim(c) => serde_json::to_vec(c),
        }
    }

    pub fn as_pod(&self) -> Result<&Pod> {
        match self {
            QuotaObject::Pod(p) => Ok(p),
            other => Err(QuotaError::UnexpectedObject {
                expected: "Pod",
                found: other.kind(),
            }),
        }
    }

    pub fn as_service(&self) -> Result<&Service> {
        match self {
            QuotaObject::Service(s) => Ok(s),
            other => Err(QuotaError::UnexpectedObject {
                expected: "Service",
                found: other.kind(),
            }),
        }
    }

    pub fn as_persistent_volume_claim(&self) -> Result<&PersistentVolumeClaim> {
        match self {
            QuotaObject::PersistentVolumeClaim(c) => Ok(c),
            other => Err(QuotaError::UnexpectedObject {
                expected: "PersistentVolumeClaim",
                found: other.kind(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_known_kinds_only() {
        let pod = QuotaObject::decode(
            PODS,
            json!({"name": "web", "namespace": "a", "spec": {"containers": []}}),
        )
        .unwrap()
        .unwrap();
        assert_eq!(pod.kind(), "Pod");
        assert_eq!(pod.namespace(), "a");

        assert!(
            QuotaObject::decode("configmaps", json!({}))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn malformed_payload_is_a_decode_error() {
        let err = QuotaObject::decode(PODS, json!({"spec": 3})).unwrap_err();
        assert!(matches!(err, QuotaError::Decode { .. }));
    }

    #[test]
    fn typed_access_rejects_other_kinds() {
        let svc = QuotaObject::decode(SERVICES, json!({"name": "s"}))
            .unwrap()
            .unwrap();
        let err = svc.as_pod().unwrap_err();
        assert_eq!(err.to_string(), "expected Pod, got Service");
    }
}
