//! Prometheus metrics for the daemon.
//!
//! HTTP request metrics are recorded by the middleware; process manager and
//! queue gauges are refreshed from application state on each scrape. Core
//! counters (task transitions, wipes, external requests) are registered too.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

use registry_core::RoutingKey;

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// =============================================================================
// HTTP Request Metrics
// =============================================================================

pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "registry_http_request_duration_seconds",
            "HTTP request duration in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        &["method", "path", "status"],
    )
    .unwrap()
});

pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("registry_http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"],
    )
    .unwrap()
});

// =============================================================================
// Process Manager Metrics (collected dynamically)
// =============================================================================

/// Serve loops running (1) or stopped (0).
pub static PROCESS_MANAGER_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "registry_process_manager_running",
        "Whether the process manager loops are running (1) or stopped (0)",
    )
    .unwrap()
});

pub static COLLECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("registry_collections", "Number of registered collections").unwrap()
});

pub static INCOMPLETE_JOBS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("registry_incomplete_jobs", "Number of jobs not yet completed").unwrap()
});

/// Undelivered messages per routing key.
pub static QUEUE_PENDING: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("registry_queue_pending", "Messages waiting for a consumer"),
        &["routing_key"],
    )
    .unwrap()
});

// =============================================================================
// Registration
// =============================================================================

fn register_metrics(registry: &Registry) {
    // HTTP
    registry
        .register(Box::new(HTTP_REQUEST_DURATION.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .unwrap();

    // Process manager
    registry
        .register(Box::new(PROCESS_MANAGER_RUNNING.clone()))
        .unwrap();
    registry.register(Box::new(COLLECTIONS.clone())).unwrap();
    registry
        .register(Box::new(INCOMPLETE_JOBS.clone()))
        .unwrap();
    registry.register(Box::new(QUEUE_PENDING.clone())).unwrap();

    // Core metrics (process passes, tasks, wipes, external services, queue)
    for metric in registry_core::metrics::all_metrics() {
        registry.register(metric).unwrap();
    }
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Refresh gauges from the process manager and the queue before a scrape.
pub async fn collect_dynamic_metrics(state: &crate::state::AppState) {
    let status = state.manager().status().await;
    PROCESS_MANAGER_RUNNING.set(i64::from(status.running));
    COLLECTIONS.set(status.collections as i64);
    INCOMPLETE_JOBS.set(status.incomplete_jobs as i64);

    for routing_key in RoutingKey::ALL {
        if let Ok(count) = state.queue().pending_count(routing_key) {
            QUEUE_PENDING
                .with_label_values(&[routing_key.as_str()])
                .set(count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_metrics_returns_prometheus_format() {
        HTTP_REQUESTS_TOTAL
            .with_label_values(&["GET", "/test", "200"])
            .inc();

        let output = encode_metrics();
        assert!(output.contains("registry_http_requests_total"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn test_registry_contains_core_metrics() {
        PROCESS_MANAGER_RUNNING.set(0);
        INCOMPLETE_JOBS.set(0);
        registry_core::metrics::JOBS_PLANNED.inc();
        registry_core::metrics::TASK_TRANSITIONS
            .with_label_values(&["collect", "started"])
            .inc();

        let output = encode_metrics();
        assert!(output.contains("registry_process_manager_running"));
        assert!(output.contains("registry_incomplete_jobs"));
        assert!(output.contains("registry_jobs_planned_total"));
        assert!(output.contains("registry_task_transitions_total"));
    }
}
