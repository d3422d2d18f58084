// SPDX-License-Identifier: Apache-2.0

//! Metrics commands.

use serde::Serialize;

use crate::metrics;

/// Response wrapper for metrics snapshot
#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub success: bool,
    pub metrics: Option<metrics::BridgeMetricsSnapshot>,
    pub error: Option<String>,
}

/// Returns the current query bridge counters.
pub fn get_metrics() -> MetricsResponse {
    MetricsResponse {
        success: true,
        metrics: Some(metrics::snapshot()),
        error: None,
    }
}
