//! Driver Metrics
//!
//! Prometheus instrumentation for the claim lifecycle and the stale-state
//! reconciliation loop. Metrics register against the default registry and
//! are exposed by the /metrics server in main.

use prometheus::{IntCounter, IntGauge};

/// Counters and gauges for one driver instance
#[derive(Clone)]
pub struct DriverMetrics {
    /// Claims prepared (new reservations)
    pub prepares_total: IntCounter,
    /// Prepare calls answered from the prepared-claim cache
    pub prepares_cached_total: IntCounter,
    /// Claims unprepared
    pub unprepares_total: IntCounter,
    /// Record writes retried after a version conflict
    pub update_conflicts_total: IntCounter,
    /// Stale-state cleanup passes run
    pub cleanup_passes_total: IntCounter,
    /// Individual cleanup unit failures across all passes
    pub cleanup_errors_total: IntCounter,
    /// Claims currently in the prepared set
    pub prepared_claims: IntGauge,
}

impl DriverMetrics {
    /// Create the metric set and register it best-effort with the default
    /// registry (re-registration in tests is harmless).
    pub fn new() -> Self {
        Self {
            prepares_total: counter(
                "gpu_driver_prepares_total",
                "Total number of claim prepare operations",
            ),
            prepares_cached_total: counter(
                "gpu_driver_prepares_cached_total",
                "Prepare calls served from the prepared-claim cache",
            ),
            unprepares_total: counter(
                "gpu_driver_unprepares_total",
                "Total number of claim unprepare operations",
            ),
            update_conflicts_total: counter(
                "gpu_driver_update_conflicts_total",
                "Allocation record writes retried after a version conflict",
            ),
            cleanup_passes_total: counter(
                "gpu_driver_cleanup_passes_total",
                "Stale-state cleanup passes run",
            ),
            cleanup_errors_total: counter(
                "gpu_driver_cleanup_errors_total",
                "Cleanup unit failures across all passes",
            ),
            prepared_claims: gauge(
                "gpu_driver_prepared_claims",
                "Claims currently holding device reservations",
            ),
        }
    }
}

impl Default for DriverMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn counter(name: &str, help: &str) -> IntCounter {
    let c = IntCounter::new(name, help).unwrap();
    let _ = prometheus::default_registry().register(Box::new(c.clone()));
    c
}

fn gauge(name: &str, help: &str) -> IntGauge {
    let g = IntGauge::new(name, help).unwrap();
    let _ = prometheus::default_registry().register(Box::new(g.clone()));
    g
}
