//! Progress counters, events and the coalescing drain.
//!
//! Subtask code updates atomic counters and pushes a [`RunningProgress`]
//! event on the task's bounded channel. Notifications may be dropped when the
//! channel is full or coalesced by the consumer; the counters never are, and
//! every `*Inc` event carries the cumulative value, so the last event seen is
//! always enough to persist the exact total.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

/// Kind of progress notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressType {
    TaskSet,
    TaskInc,
    SubTaskSet,
    SubTaskInc,
    SetCurrentSubTask,
}

/// One in-memory progress notification.
///
/// For `TaskInc`/`SubTaskInc` `current` is the counter value after the
/// increment. For `SetCurrentSubTask` it is the 1-based subtask number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningProgress {
    pub kind: ProgressType,
    pub current: u64,
    pub total: u64,
    pub sub_task_name: Option<String>,
}

impl RunningProgress {
    pub fn new(kind: ProgressType, current: u64, total: u64) -> Self {
        Self {
            kind,
            current,
            total,
            sub_task_name: None,
        }
    }

    pub fn for_subtask(mut self, name: impl Into<String>) -> Self {
        self.sub_task_name = Some(name.into());
        self
    }
}

pub type ProgressSender = mpsc::Sender<RunningProgress>;
pub type ProgressReceiver = mpsc::Receiver<RunningProgress>;

/// Creates the bounded single-consumer channel attached to a task.
pub fn progress_channel(capacity: usize) -> (ProgressSender, ProgressReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Pushes an event without blocking the producer.
///
/// A full channel drops the notification; the counter already holds the value.
pub(crate) fn emit(sender: Option<&ProgressSender>, event: RunningProgress) {
    if let Some(tx) = sender {
        if let Err(e) = tx.try_send(event) {
            trace!(error = %e, "Progress notification skipped");
        }
    }
}

/// Atomic current/total pair.
#[derive(Debug, Default)]
pub struct ProgressCounter {
    current: AtomicU64,
    total: AtomicU64,
}

impl ProgressCounter {
    pub fn set(&self, current: u64, total: u64) {
        self.current.store(current, Ordering::SeqCst);
        self.total.store(total, Ordering::SeqCst);
    }

    /// Adds `quantity` and returns the new value.
    pub fn add(&self, quantity: u64) -> u64 {
        self.current.fetch_add(quantity, Ordering::SeqCst) + quantity
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }
}

/// Collapses every run of consecutive `SubTaskInc` events for the same
/// subtask into its most recent event. Other events pass through in order.
pub fn coalesce_progress<I>(events: I) -> Vec<RunningProgress>
where
    I: IntoIterator<Item = RunningProgress>,
{
    let mut out: Vec<RunningProgress> = Vec::new();
    for event in events {
        let replaces_last = matches!(
            out.last(),
            Some(last) if last.kind == ProgressType::SubTaskInc
                && event.kind == ProgressType::SubTaskInc
                && last.sub_task_name == event.sub_task_name
        );
        if replaces_last {
            if let Some(last) = out.last_mut() {
                *last = event;
            }
        } else {
            out.push(event);
        }
    }
    out
}

/// Takes `first` plus everything already buffered in `rx` and coalesces the burst.
pub fn drain_coalesced(first: RunningProgress, rx: &mut ProgressReceiver) -> Vec<RunningProgress> {
    let mut burst = vec![first];
    while let Ok(event) = rx.try_recv() {
        burst.push(event);
    }
    coalesce_progress(burst)
}

/// Materialized task progress, persisted on the task record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskProgressDetail {
    pub finished_subtasks: u64,
    pub total_subtasks: u64,
    pub subtask_number: u64,
    pub subtask_name: Option<String>,
    pub finished_records: u64,
    pub total_records: u64,
}

impl TaskProgressDetail {
    pub fn apply(&mut self, event: &RunningProgress) {
        match event.kind {
            ProgressType::TaskSet => {
                self.finished_subtasks = event.current;
                self.total_subtasks = event.total;
            }
            ProgressType::TaskInc => {
                self.finished_subtasks = event.current;
            }
            ProgressType::SubTaskSet => {
                self.finished_records = event.current;
                self.total_records = event.total;
            }
            ProgressType::SubTaskInc => {
                self.finished_records = event.current;
            }
            ProgressType::SetCurrentSubTask => {
                self.subtask_number = event.current;
                self.subtask_name = event.sub_task_name.clone();
                self.finished_records = 0;
                self.total_records = 0;
            }
        }
    }

    /// Fraction of subtasks finished, in `0.0..=1.0`.
    pub fn fraction(&self) -> f64 {
        if self.total_subtasks == 0 {
            0.0
        } else {
            (self.finished_subtasks as f64 / self.total_subtasks as f64).min(1.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inc(name: &str, current: u64) -> RunningProgress {
        RunningProgress::new(ProgressType::SubTaskInc, current, 0).for_subtask(name)
    }

    #[test]
    fn test_coalesce_keeps_latest_increment() {
        let events = vec![inc("collect", 1), inc("collect", 3), inc("collect", 6)];
        assert_eq!(coalesce_progress(events), vec![inc("collect", 6)]);
    }

    #[test]
    fn test_coalesce_preserves_boundaries() {
        let switch = RunningProgress::new(ProgressType::SetCurrentSubTask, 2, 0).for_subtask("extract");
        let events = vec![
            inc("collect", 1),
            inc("collect", 2),
            switch.clone(),
            inc("extract", 1),
            inc("extract", 4),
        ];
        assert_eq!(
            coalesce_progress(events),
            vec![inc("collect", 2), switch, inc("extract", 4)]
        );
    }

    #[test]
    fn test_counter_sum_survives_dropped_notifications() {
        let counter = ProgressCounter::default();
        let (tx, mut rx) = progress_channel(2);
        for n in 1..=10u64 {
            let current = counter.add(n);
            emit(Some(&tx), inc("collect", current));
        }
        assert_eq!(counter.current(), 55);

        let first = rx.try_recv().unwrap();
        let drained = drain_coalesced(first, &mut rx);
        assert_eq!(drained.len(), 1);
        // Only two notifications fit; the counter still holds the full sum.
        assert_eq!(drained[0].current, 3);
    }

    #[test]
    fn test_detail_apply() {
        let mut detail = TaskProgressDetail::default();
        detail.apply(&RunningProgress::new(ProgressType::TaskSet, 0, 4));
        detail.apply(&RunningProgress::new(ProgressType::SetCurrentSubTask, 1, 0).for_subtask("collect"));
        detail.apply(&inc("collect", 20));
        detail.apply(&RunningProgress::new(ProgressType::TaskInc, 1, 0));

        assert_eq!(detail.subtask_name.as_deref(), Some("collect"));
        assert_eq!(detail.finished_records, 20);
        assert!((detail.fraction() - 0.25).abs() < f64::EPSILON);
    }
}
