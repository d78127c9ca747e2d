//! Reconciler, retry, and session affinity defaults.

/// Default session affinity timeout (3 hours), in seconds.
pub const DEFAULT_AFFINITY_TIMEOUT_SECS: u32 = 10_800;

/// Upper bound for a session affinity timeout (1 day), in seconds.
pub const MAX_AFFINITY_TIMEOUT_SECS: u32 = 86_400;

/// How often expired affinity bindings are swept.
pub const DEFAULT_AFFINITY_SWEEP_INTERVAL_SECS: u64 = 10;

/// Default weight of an endpoint (equal share).
pub const DEFAULT_ENDPOINT_WEIGHT: u16 = 100;

/// Bound on a single executor call before it counts as a timeout.
pub const DEFAULT_EXECUTOR_TIMEOUT_MS: u64 = 2_000;

/// Executor call attempts before a Service is marked degraded.
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 5;

/// First retry delay, in milliseconds.
pub const DEFAULT_RETRY_INITIAL_DELAY_MS: u64 = 100;

/// Retry delay cap, in milliseconds.
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 10_000;

/// How long Endpoints for an unknown Service are buffered, in seconds.
pub const DEFAULT_PENDING_ENDPOINTS_TTL_SECS: u64 = 60;

/// Interval between resyncs of degraded Services, in seconds.
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 30;

/// Capacity of each per-Service event queue.
pub const KEY_QUEUE_CAPACITY: usize = 64;
