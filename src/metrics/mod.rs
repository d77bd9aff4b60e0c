//! Prometheus metrics for tasks, subtasks and API requests.
//!
//! # Example
//!
//! ```ignore
//! use pipeforge::metrics::{export_metrics, init_metrics, MetricsRecorder};
//!
//! init_metrics()?;
//! MetricsRecorder::new().record_task("github", "TASK_COMPLETED");
//! println!("{}", export_metrics());
//! ```

pub mod prometheus;
pub mod recorder;

pub use prometheus::{
    export_metrics, init_metrics, API_REQUESTS_TOTAL, API_RETRIES_TOTAL, REGISTRY, RUNNING_TASKS,
    SUBTASK_DURATION, TASKS_TOTAL,
};
pub use recorder::MetricsRecorder;
