//! Metrics collector using prometheus-client.
//!
//! Exposes shutdown progress: in-flight operations and the current phase,
//! sampled from the coordinator at scrape time.

use crate::shutdown::{ShutdownCoordinator, ShutdownPhase};
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::Arc;

/// Collects and stores all metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsCollectorInner>,
}

struct MetricsCollectorInner {
    coordinator: ShutdownCoordinator,
    /// Operations currently in flight.
    operations_in_flight: Gauge,
    /// 0 = running, 1 = draining, 2 = complete, 3 = forced.
    shutdown_phase: Gauge,
    registry: Registry,
}

impl MetricsCollector {
    /// Create a collector reporting on `coordinator`.
    pub fn new(coordinator: ShutdownCoordinator) -> Self {
        let mut registry = Registry::default();

        let operations_in_flight = Gauge::default();
        let shutdown_phase = Gauge::default();

        registry.register(
            "softstop_operations_in_flight",
            "Number of operations currently in flight",
            operations_in_flight.clone(),
        );
        registry.register(
            "softstop_shutdown_phase",
            "Shutdown phase (0=running, 1=draining, 2=complete, 3=forced)",
            shutdown_phase.clone(),
        );

        Self {
            inner: Arc::new(MetricsCollectorInner {
                coordinator,
                operations_in_flight,
                shutdown_phase,
                registry,
            }),
        }
    }

    /// Sample the coordinator into the gauges.
    pub fn refresh(&self) {
        let coordinator = &self.inner.coordinator;
        self.inner
            .operations_in_flight
            .set(coordinator.tracker().count() as i64);
        self.inner.shutdown_phase.set(phase_value(coordinator.phase()));
    }

    /// Get the prometheus registry for encoding.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }
}

fn phase_value(phase: ShutdownPhase) -> i64 {
    match phase {
        ShutdownPhase::Running => 0,
        ShutdownPhase::Draining => 1,
        ShutdownPhase::Complete => 2,
        ShutdownPhase::Forced => 3,
    }
}
