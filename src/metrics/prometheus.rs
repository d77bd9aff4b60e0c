//! Prometheus metrics registration and export.

use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all pipeforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Finished tasks, labeled by plugin and terminal status.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Subtask run time in seconds, labeled by plugin and subtask.
pub static SUBTASK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// API responses and transport failures, labeled by status.
pub static API_REQUESTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

pub static API_RETRIES_TOTAL: OnceLock<IntCounter> = OnceLock::new();

/// Tasks currently executing.
pub static RUNNING_TASKS: OnceLock<Gauge> = OnceLock::new();

/// Creates every metric and registers it with [`REGISTRY`].
///
/// Calling it again is harmless: metrics that already exist are kept.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let tasks_total = CounterVec::new(
        Opts::new("pipeforge_tasks_total", "Total number of finished tasks"),
        &["plugin", "status"],
    )?;

    let subtask_duration = HistogramVec::new(
        HistogramOpts::new(
            "pipeforge_subtask_duration_seconds",
            "Subtask execution duration in seconds",
        )
        .buckets(vec![0.1, 1.0, 5.0, 30.0, 120.0, 600.0, 3600.0]),
        &["plugin", "subtask"],
    )?;

    let api_requests_total = CounterVec::new(
        Opts::new("pipeforge_api_requests_total", "Total API requests by outcome"),
        &["status"],
    )?;

    let api_retries_total =
        IntCounter::new("pipeforge_api_retries_total", "Total retried API requests")?;

    let running_tasks = Gauge::new("pipeforge_running_tasks", "Number of tasks currently running")?;

    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(subtask_duration.clone()))?;
    registry.register(Box::new(api_requests_total.clone()))?;
    registry.register(Box::new(api_retries_total.clone()))?;
    registry.register(Box::new(running_tasks.clone()))?;

    // A concurrent initializer may have won; its metrics stay in place.
    let _ = REGISTRY.set(registry);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = SUBTASK_DURATION.set(subtask_duration);
    let _ = API_REQUESTS_TOTAL.set(api_requests_total);
    let _ = API_RETRIES_TOTAL.set(api_retries_total);
    let _ = RUNNING_TASKS.set(running_tasks);

    tracing::info!("Prometheus metrics initialized");
    Ok(())
}

/// All registered metrics in Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
