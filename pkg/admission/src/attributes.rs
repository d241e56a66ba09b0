use pkg_quota::object::QuotaObject;
use pkg_types::admission::{AdmissionRequest, Operation, UserInfo};

use crate::AdmissionError;

/// A decoded admission request.
#[derive(Debug, Clone)]
pub struct Attributes {
    pub uid: String,
    pub namespace: String,
    pub name: String,
    /// Plural resource, e.g. `pods`.
    pub resource: String,
    pub sub_resource: Option<String>,
    pub operation: Operation,
    /// `None` when the resource is not one any evaluator tracks.
    pub object: Option<QuotaObject>,
    pub old_object: Option<QuotaObject>,
    pub dry_run: bool,
    pub user: UserInfo,
}

impl Attributes {
    pub fn new(namespace: &str, operation: Operation, object: QuotaObject) -> Self {
        Self {
            uid: String::new(),
            namespace: namespace.to_string(),
            name: object.name().to_string(),
            resource: object.resource().to_string(),
            sub_resource: None,
            operation,
            object: Some(object),
            old_object: None,
            dry_run: false,
            user: UserInfo::default(),
        }
    }

    pub fn with_old_object(mut self, old: QuotaObject) -> Self {
        self.old_object = Some(old);
        self
    }

    pub fn from_request(req: &AdmissionRequest) -> Result<Self, AdmissionError> {
        let resource = req.resource.resource.clone();
        let decode = |value: &Option<serde_json::Value>| -> Result<Option<QuotaObject>, AdmissionError> {
            match value {
                Some(v) if !v.is_null() => Ok(QuotaObject::decode(&resource, v.clone())?),
                _ => Ok(None),
            }
        };
        let object = decode(&req.object)?;
        let old_object = decode(&req.old_object)?;
        let sub_resource = req
            .request_sub_resource
            .clone()
            .or_else(|| req.sub_resource.clone())
            .filter(|s| !s.is_empty());

        Ok(Self {
            uid: req.uid.clone(),
            namespace: req.namespace.clone().unwrap_or_default(),
            name: req.name.clone().unwrap_or_default(),
            resource,
            sub_resource,
            operation: req.operation,
            object,
            old_object,
            dry_run: req.dry_run.unwrap_or(false),
            user: req.user_info.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(value: serde_json::Value) -> AdmissionRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn decodes_pod_request() {
        let req = request(json!({
            "uid": "r1",
            "kind": {"group": "", "version": "v1", "kind": "Pod"},
            "resource": {"group": "", "version": "v1", "resource": "pods"},
            "namespace": "team-a",
            "operation": "CREATE",
            "userInfo": {"username": "alice"},
            "object": {"name": "web", "namespace": "team-a", "spec": {"containers": []}},
            "dryRun": true
        }));
        let attrs = Attributes::from_request(&req).unwrap();
        assert_eq!(attrs.namespace, "team-a");
        assert!(attrs.dry_run);
        assert!(attrs.sub_resource.is_none());
        assert_eq!(attrs.object.unwrap().name(), "web");
        assert!(attrs.old_object.is_none());
    }

    #[test]
    fn malformed_object_is_bad_request() {
        let req = request(json!({
            "uid": "r1",
            "kind": {"kind": "Pod", "version": "v1"},
            "resource": {"resource": "pods", "version": "v1"},
            "namespace": "team-a",
            "operation": "CREATE",
            "object": {"spec": "nope"}
        }));
        let err = Attributes::from_request(&req).unwrap_err();
        assert_eq!(err.code(), 400);
    }

    #[test]
    fn untracked_resources_carry_no_object() {
        let req = request(json!({
            "uid": "r1",
            "kind": {"kind": "ConfigMap", "version": "v1"},
            "resource": {"resource": "configmaps", "version": "v1"},
            "namespace": "team-a",
            "operation": "CREATE",
            "subResource": "status",
            "object": {"data": {}}
        }));
        let attrs = Attributes::from_request(&req).unwrap();
        assert!(attrs.object.is_none());
        assert_eq!(attrs.sub_resource.as_deref(), Some("status"));
    }
}
