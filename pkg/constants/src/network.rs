//! Network-related constants.

/// Default API server address (HTTP) the proxy watches.
pub const DEFAULT_API_ADDR: &str = "http://127.0.0.1:6443";

/// Default port for the flow proxy status / dump HTTP server.
pub const DEFAULT_STATUS_PORT: u16 = 10256;

/// Watch path on the API server (SSE stream).
pub const WATCH_PATH: &str = "/api/v1/watch";

/// Registry prefix for Service objects: `/registry/services/<ns>/<id>`.
pub const SERVICES_PREFIX: &str = "/registry/services/";

/// Registry prefix for Endpoint objects: `/registry/endpoints/<ns>/<service_id>`.
pub const ENDPOINTS_PREFIX: &str = "/registry/endpoints/";
