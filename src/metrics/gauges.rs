//! Gauge metrics

use super::labels;

/// Current pool occupancy
pub(crate) fn pool_occupancy(active: usize, idle: usize, waiting: usize) {
    metrics::gauge!(labels::POOL_ACTIVE).set(active as f64);
    metrics::gauge!(labels::POOL_IDLE).set(idle as f64);
    metrics::gauge!(labels::POOL_WAITING).set(waiting as f64);
}
