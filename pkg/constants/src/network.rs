//! Network-related constants.

/// Default port for the shared-quota API / webhook server.
pub const DEFAULT_API_PORT: u16 = 8443;

/// Path the admission webhook is served on.
pub const WEBHOOK_PATH: &str = "/validate-quota-v1";
