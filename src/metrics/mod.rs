//! Metrics recording
//!
//! Thin wrappers over the `metrics` facade. Nothing is exported unless the
//! application installs a recorder.

pub(crate) mod counters;
pub(crate) mod gauges;
pub(crate) mod histograms;
pub(crate) mod labels;
