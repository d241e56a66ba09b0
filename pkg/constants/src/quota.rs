//! Admission and reconciliation defaults.

/// Full recalculation period for every shared quota, in seconds.
pub const DEFAULT_RESYNC_PERIOD_SECS: u64 = 300;

/// Number of reconcile workers (distinct quotas reconciled in parallel).
pub const DEFAULT_MAX_CONCURRENT_RECONCILES: usize = 8;

/// Number of admission requests evaluated concurrently.
pub const DEFAULT_ADMISSION_WORKERS: usize = 10;

/// Deadline for a single admission evaluation, in milliseconds.
pub const DEFAULT_ADMISSION_TIMEOUT_MS: u64 = 10_000;

/// How many times admission re-reads and retries after a status write conflict.
pub const ADMISSION_CONFLICT_RETRIES: usize = 3;

/// Work queue backoff: first retry delay, in milliseconds.
pub const QUEUE_BASE_DELAY_MS: u64 = 5;

/// Work queue backoff: maximum retry delay, in seconds.
pub const QUEUE_MAX_DELAY_SECS: u64 = 1000;
