//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Process manager (jobs planned and finished, task transitions)
//! - Cleanup (wipes, archived and deleted jobs)
//! - External services (request durations and outcomes)
//! - Message queue (published and acknowledged messages)

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts};

// =============================================================================
// Process Manager Metrics
// =============================================================================

/// Jobs created by the scheduler.
pub static JOBS_PLANNED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("registry_jobs_planned_total", "Total jobs planned").unwrap()
});

/// Jobs that reached COMPLETED, by result.
pub static JOBS_FINISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("registry_jobs_finished_total", "Total jobs completed"),
        &["result"], // "succeeded", "failed"
    )
    .unwrap()
});

/// Task transitions by task type and outcome.
pub static TASK_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "registry_task_transitions_total",
            "Task state transitions applied by the process manager",
        ),
        &["type", "outcome"], // outcome: "started", "pending", "completed", "failed", "transient"
    )
    .unwrap()
});

/// Duration of a full processing pass over all collections.
pub static PROCESS_PASS_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "registry_process_pass_duration_seconds",
            "Duration of one processing pass",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]),
        &[],
    )
    .unwrap()
});

// =============================================================================
// Cleanup Metrics
// =============================================================================

/// Wipe calls by task type and result.
pub static WIPES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("registry_wipes_total", "Task wipe attempts"),
        &["type", "result"], // result: "success", "error"
    )
    .unwrap()
});

/// Jobs archived by the cleanup sweep.
pub static JOBS_ARCHIVED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("registry_jobs_archived_total", "Total jobs archived").unwrap()
});

/// Jobs deleted after being superseded.
pub static JOBS_DELETED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("registry_jobs_deleted_total", "Total jobs deleted").unwrap()
});

// =============================================================================
// External Service Metrics
// =============================================================================

/// External service request duration.
pub static EXTERNAL_SERVICE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "registry_external_service_duration_seconds",
            "Duration of external service calls",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 120.0]),
        &["service"],
    )
    .unwrap()
});

/// External service requests total.
pub static EXTERNAL_SERVICE_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "registry_external_service_requests_total",
            "Total external service requests",
        ),
        &["service", "status"], // status: "success", "error"
    )
    .unwrap()
});

// =============================================================================
// Queue Metrics
// =============================================================================

/// Messages published by routing key.
pub static QUEUE_PUBLISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("registry_queue_published_total", "Messages published"),
        &["routing_key"],
    )
    .unwrap()
});

/// Messages acknowledged by routing key.
pub static QUEUE_ACKED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("registry_queue_acked_total", "Messages acknowledged"),
        &["routing_key"],
    )
    .unwrap()
});

// =============================================================================
// Registration
// =============================================================================

/// All core metrics, for registration with a registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Process manager
        Box::new(JOBS_PLANNED.clone()),
        Box::new(JOBS_FINISHED.clone()),
        Box::new(TASK_TRANSITIONS.clone()),
        Box::new(PROCESS_PASS_DURATION.clone()),
        // Cleanup
        Box::new(WIPES_TOTAL.clone()),
        Box::new(JOBS_ARCHIVED.clone()),
        Box::new(JOBS_DELETED.clone()),
        // External services
        Box::new(EXTERNAL_SERVICE_DURATION.clone()),
        Box::new(EXTERNAL_SERVICE_REQUESTS.clone()),
        // Queue
        Box::new(QUEUE_PUBLISHED.clone()),
        Box::new(QUEUE_ACKED.clone()),
    ]
}
