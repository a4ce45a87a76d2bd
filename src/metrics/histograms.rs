//! Histogram metrics

use super::labels;

/// Time from query frame written to settlement
pub(crate) fn query_duration(duration_ms: u64) {
    metrics::histogram!(labels::QUERY_DURATION).record(duration_ms as f64);
}

/// Time a caller spent inside `acquire()`
pub(crate) fn pool_wait(duration_ms: u64) {
    metrics::histogram!(labels::POOL_WAIT).record(duration_ms as f64);
}
