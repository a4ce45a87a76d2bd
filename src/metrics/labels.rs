//! Metric names and label values

pub(crate) const CONNECTIONS_OPENED: &str = "wirepool_connections_opened_total";
pub(crate) const CONNECTIONS_CLOSED: &str = "wirepool_connections_closed_total";
pub(crate) const QUERIES: &str = "wirepool_queries_total";
pub(crate) const ERRORS: &str = "wirepool_errors_total";
pub(crate) const QUERY_DURATION: &str = "wirepool_query_duration_ms";
pub(crate) const POOL_WAIT: &str = "wirepool_pool_wait_ms";
pub(crate) const POOL_ACTIVE: &str = "wirepool_pool_active";
pub(crate) const POOL_IDLE: &str = "wirepool_pool_idle";
pub(crate) const POOL_WAITING: &str = "wirepool_pool_waiting";

pub(crate) const STATUS_OK: &str = "ok";
pub(crate) const STATUS_ERROR: &str = "error";
pub(crate) const STATUS_TIMEOUT: &str = "timeout";
