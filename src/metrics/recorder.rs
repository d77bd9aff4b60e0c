//! Recording facade over the Prometheus statics.
//!
//! Every method is a no-op until [`init_metrics`](super::init_metrics) has
//! run, so library code records unconditionally.

use std::time::Duration;

use super::prometheus::{
    API_REQUESTS_TOTAL, API_RETRIES_TOTAL, RUNNING_TASKS, SUBTASK_DURATION, TASKS_TOTAL,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsRecorder;

impl MetricsRecorder {
    pub fn new() -> Self {
        Self
    }

    /// A task reached a terminal status.
    pub fn record_task(&self, plugin: &str, status: &str) {
        if let Some(total) = TASKS_TOTAL.get() {
            total.with_label_values(&[plugin, status]).inc();
        }
        tracing::trace!(plugin, status, "Recorded task metric");
    }

    pub fn record_subtask(&self, plugin: &str, subtask: &str, elapsed: Duration) {
        if let Some(duration) = SUBTASK_DURATION.get() {
            duration
                .with_label_values(&[plugin, subtask])
                .observe(elapsed.as_secs_f64());
        }
    }

    /// One API attempt; `status` is the HTTP status or an error class.
    pub fn record_api_request(&self, status: &str) {
        if let Some(total) = API_REQUESTS_TOTAL.get() {
            total.with_label_values(&[status]).inc();
        }
    }

    pub fn record_api_retry(&self) {
        if let Some(total) = API_RETRIES_TOTAL.get() {
            total.inc();
        }
    }

    pub fn task_started(&self) {
        if let Some(running) = RUNNING_TASKS.get() {
            running.inc();
        }
    }

    pub fn task_finished(&self) {
        if let Some(running) = RUNNING_TASKS.get() {
            running.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_after_init() {
        super::super::init_metrics().unwrap();
        let recorder = MetricsRecorder::new();
        recorder.record_task("github", "TASK_COMPLETED");
        recorder.record_subtask("github", "collectIssues", Duration::from_millis(250));
        recorder.record_api_request("200");

        let text = super::super::export_metrics();
        assert!(text.contains("pipeforge_tasks_total"));
        assert!(text.contains("collectIssues"));
    }
}
