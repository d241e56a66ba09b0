//! State store key layout.
//!
//! Namespaced objects live under `<prefix><namespace>/<name>`,
//! cluster-scoped objects under `<prefix><name>`.

/// Cluster-scoped namespaces.
pub const NAMESPACES_PREFIX: &str = "/registry/namespaces/";

/// Cluster-scoped shared quotas.
pub const SHARED_QUOTAS_PREFIX: &str = "/registry/sharedquotas/";

pub const PODS_PREFIX: &str = "/registry/pods/";

pub const SERVICES_PREFIX: &str = "/registry/services/";

pub const PVCS_PREFIX: &str = "/registry/persistentvolumeclaims/";

/// Number of recent watch events retained for replay.
pub const EVENT_LOG_CAPACITY: usize = 4096;
