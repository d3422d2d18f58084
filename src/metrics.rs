// SPDX-License-Identifier: Apache-2.0

//! Lightweight in-memory counters for the query bridge.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use serde::Serialize;

#[derive(Default)]
struct BridgeMetrics {
    dispatched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    rejected: AtomicU64,
    implicit_begins: AtomicU64,
    auto_rollbacks: AtomicU64,
    duration_total_ms: AtomicU64,
    duration_max_ms: AtomicU64,
}

static BRIDGE_METRICS: OnceLock<BridgeMetrics> = OnceLock::new();

fn metrics() -> &'static BridgeMetrics {
    BRIDGE_METRICS.get_or_init(BridgeMetrics::default)
}

pub fn record_dispatch() {
    metrics().dispatched.fetch_add(1, Ordering::Relaxed);
}

/// A dispatch refused because another execution was in flight.
pub fn record_rejected() {
    metrics().rejected.fetch_add(1, Ordering::Relaxed);
}

pub fn record_implicit_begin() {
    metrics().implicit_begins.fetch_add(1, Ordering::Relaxed);
}

pub fn record_auto_rollback() {
    metrics().auto_rollbacks.fetch_add(1, Ordering::Relaxed);
}

pub fn record_cancel() {
    metrics().cancelled.fetch_add(1, Ordering::Relaxed);
}

/// Records a finished execution as seen by its worker.
pub fn record_execution(duration_ms: f64, success: bool) {
    let duration_ms = duration_ms.max(0.0) as u64;
    let metrics = metrics();
    if success {
        metrics.completed.fetch_add(1, Ordering::Relaxed);
    } else {
        metrics.failed.fetch_add(1, Ordering::Relaxed);
    }
    metrics
        .duration_total_ms
        .fetch_add(duration_ms, Ordering::Relaxed);

    let mut current = metrics.duration_max_ms.load(Ordering::Relaxed);
    while duration_ms > current {
        match metrics.duration_max_ms.compare_exchange(
            current,
            duration_ms,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(next) => current = next,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BridgeMetricsSnapshot {
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub rejected: u64,
    pub implicit_begins: u64,
    pub auto_rollbacks: u64,
    pub avg_ms: Option<f64>,
    pub max_ms: Option<u64>,
}

pub fn snapshot() -> BridgeMetricsSnapshot {
    let metrics = metrics();
    let completed = metrics.completed.load(Ordering::Relaxed);
    let failed = metrics.failed.load(Ordering::Relaxed);
    let finished = completed + failed;
    let duration_total = metrics.duration_total_ms.load(Ordering::Relaxed);
    let max_ms = metrics.duration_max_ms.load(Ordering::Relaxed);

    let avg_ms = if finished > 0 {
        Some(duration_total as f64 / finished as f64)
    } else {
        None
    };

    BridgeMetricsSnapshot {
        dispatched: metrics.dispatched.load(Ordering::Relaxed),
        completed,
        failed,
        cancelled: metrics.cancelled.load(Ordering::Relaxed),
        rejected: metrics.rejected.load(Ordering::Relaxed),
        implicit_begins: metrics.implicit_begins.load(Ordering::Relaxed),
        auto_rollbacks: metrics.auto_rollbacks.load(Ordering::Relaxed),
        avg_ms,
        max_ms: if max_ms > 0 { Some(max_ms) } else { None },
    }
}
