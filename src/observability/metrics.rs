//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Hold the counters and gauges the multiplexing core maintains
//! - Mirror every update to the `metrics` facade for Prometheus scraping
//! - Let tests and operators read exact values back
//!
//! # Metrics
//! - `<destination>.rx_reset` / `<destination>.tx_reset` (counter): stream
//!   resets received from / sent to the upstream
//! - `downstream.rx_reset` / `downstream.tx_reset` (counter): resets received
//!   from / sent toward the original caller
//! - `<destination>.upstream_cx_close_notify` (counter): graceful-shutdown
//!   signals received
//! - `<class>.streams_active` (gauge): live streams per protocol class
//! - `<class>.pending_send_bytes` (gauge): request bytes waiting for credit
//!
//! # Design Decisions
//! - The registry is a value handed to the pool and each connection, never a
//!   process global
//! - Updates are single atomic operations

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;

pub const DOWNSTREAM_RX_RESET: &str = "downstream.rx_reset";
pub const DOWNSTREAM_TX_RESET: &str = "downstream.tx_reset";

/// Counter and gauge registry shared by the pool and its connections.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    inner: Arc<Registry>,
}

#[derive(Debug, Default)]
struct Registry {
    counters: DashMap<String, AtomicU64>,
    gauges: DashMap<String, AtomicI64>,
}

/// Point-in-time copy of every stat.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, i64>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by one.
    pub fn inc(&self, name: &str) {
        self.add(name, 1);
    }

    /// Increment a counter by `value`.
    pub fn add(&self, name: &str, value: u64) {
        self.inner
            .counters
            .entry(name.to_string())
            .or_default()
            .fetch_add(value, Ordering::Relaxed);
        metrics::counter!(name.to_string()).increment(value);
    }

    /// Current counter value (0 if never touched).
    pub fn counter(&self, name: &str) -> u64 {
        self.inner
            .counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Move a gauge by `delta`.
    pub fn gauge_add(&self, name: &str, delta: i64) {
        if delta == 0 {
            return;
        }
        let value = self
            .inner
            .gauges
            .entry(name.to_string())
            .or_default()
            .fetch_add(delta, Ordering::Relaxed)
            + delta;
        metrics::gauge!(name.to_string()).set(value as f64);
    }

    /// Current gauge value (0 if never touched).
    pub fn gauge(&self, name: &str) -> i64 {
        self.inner
            .gauges
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            counters: self
                .inner
                .counters
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                .collect(),
            gauges: self
                .inner
                .gauges
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                .collect(),
        }
    }
}

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}
