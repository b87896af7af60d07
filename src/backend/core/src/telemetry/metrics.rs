//! Prometheus metrics for the job scheduler, event correlation and units of work.
//!
//! # Example
//!
//! ```rust,no_run
//! use conductor_core::telemetry::metrics::JobMetrics;
//!
//! JobMetrics::record_acquired("default", "billing", 3);
//! JobMetrics::record_failed("billing", "delegate", 2);
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Histogram buckets for job execution durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

// Default value functions
fn default_metrics_enabled() -> bool {
    true
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
}

/// Handle on the installed Prometheus recorder.
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// A registry with no recorder behind it.
    pub fn disabled() -> Self {
        Self {
            prometheus_handle: None,
        }
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Initialize the metrics subsystem.
///
/// # Errors
///
/// Returns an error if the buckets are invalid or a recorder is already installed.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let mut builder = PrometheusBuilder::new();

    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }

    builder = builder.set_buckets(&config.duration_buckets)?;

    let handle = builder.install_recorder()?;

    register_metric_descriptions();

    tracing::info!(service_name = %service_name, "Metrics initialized");

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

/// Register all metric descriptions.
fn register_metric_descriptions() {
    // Job metrics
    describe_counter!("conductor_jobs_acquired_total", "Jobs locked by acquisition cycles");
    describe_counter!("conductor_jobs_executed_total", "Jobs executed successfully");
    describe_counter!("conductor_jobs_failed_total", "Job executions that failed");
    describe_counter!(
        "conductor_jobs_exhausted_total",
        "Jobs that ran out of retries and need operator action"
    );
    describe_counter!(
        "conductor_jobs_rejected_total",
        "Locked jobs handed back because no worker was free"
    );
    describe_histogram!("conductor_job_execution_seconds", "Job execution duration in seconds");

    // Acquisition metrics
    describe_counter!("conductor_acquisition_cycles_total", "Acquisition cycles run");
    describe_counter!(
        "conductor_lock_conflicts_total",
        "Jobs skipped because another owner holds the lock"
    );
    describe_gauge!("conductor_worker_pool_active", "Jobs currently executing");

    // Events and units of work
    describe_counter!("conductor_events_delivered_total", "Events delivered to subscriptions");
    describe_counter!(
        "conductor_listener_failures_total",
        "Transaction listeners that returned an error"
    );
    describe_counter!("conductor_units_of_work_total", "Units of work closed, by outcome");

    // Errors
    describe_counter!("conductor_errors_total", "Errors constructed, by code");
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Metrics
// ═══════════════════════════════════════════════════════════════════════════════

/// Scheduler and job execution metrics.
pub struct JobMetrics;

impl JobMetrics {
    /// Record a finished acquisition cycle.
    pub fn record_acquired(acquisition: &str, engine: &str, count: usize) {
        counter!(
            "conductor_acquisition_cycles_total",
            "acquisition" => acquisition.to_string(),
        )
        .increment(1);

        if count > 0 {
            counter!(
                "conductor_jobs_acquired_total",
                "acquisition" => acquisition.to_string(),
                "engine" => engine.to_string(),
            )
            .increment(count as u64);
        }
    }

    /// Record a job skipped because another owner locked it first.
    pub fn record_lock_conflict(acquisition: &str) {
        counter!(
            "conductor_lock_conflicts_total",
            "acquisition" => acquisition.to_string(),
        )
        .increment(1);
    }

    /// Record a successful job execution.
    pub fn record_executed(engine: &str, handler_type: &str, duration: Duration) {
        counter!(
            "conductor_jobs_executed_total",
            "engine" => engine.to_string(),
            "handler" => handler_type.to_string(),
        )
        .increment(1);

        histogram!(
            "conductor_job_execution_seconds",
            "handler" => handler_type.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Record a failed job execution.
    pub fn record_failed(engine: &str, handler_type: &str, retries_left: i32) {
        counter!(
            "conductor_jobs_failed_total",
            "engine" => engine.to_string(),
            "handler" => handler_type.to_string(),
        )
        .increment(1);

        if retries_left <= 0 {
            counter!(
                "conductor_jobs_exhausted_total",
                "engine" => engine.to_string(),
                "handler" => handler_type.to_string(),
            )
            .increment(1);
        }
    }

    /// Record a job handed back because the worker pool was saturated.
    pub fn record_rejected(acquisition: &str) {
        counter!(
            "conductor_jobs_rejected_total",
            "acquisition" => acquisition.to_string(),
        )
        .increment(1);
    }

    /// Set the number of jobs currently executing.
    pub fn set_active_workers(pool: &str, active: usize) {
        gauge!("conductor_worker_pool_active", "pool" => pool.to_string()).set(active as f64);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Engine Metrics
// ═══════════════════════════════════════════════════════════════════════════════

/// Unit of work and correlation metrics.
pub struct EngineMetrics;

impl EngineMetrics {
    pub fn record_event_delivered(event_type: &str) {
        counter!(
            "conductor_events_delivered_total",
            "event_type" => event_type.to_string(),
        )
        .increment(1);
    }

    pub fn record_listener_failure(outcome: &str) {
        counter!(
            "conductor_listener_failures_total",
            "outcome" => outcome.to_string(),
        )
        .increment(1);
    }

    pub fn record_unit_of_work(outcome: &str) {
        counter!(
            "conductor_units_of_work_total",
            "outcome" => outcome.to_string(),
        )
        .increment(1);
    }
}

/// Utility for tracking operation timing with automatic metric recording.
pub struct OperationTimer {
    start: Instant,
    operation_name: &'static str,
}

impl OperationTimer {
    /// Start timing an operation.
    pub fn start(operation_name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation_name,
        }
    }

    /// Get elapsed time without recording.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Finish and record to the generic operation histogram.
    pub fn finish(self) -> Duration {
        let duration = self.start.elapsed();

        histogram!(
            "conductor_operation_duration_seconds",
            "operation" => self.operation_name,
        )
        .record(duration.as_secs_f64());

        duration
    }
}
