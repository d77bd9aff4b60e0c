//! Execution of one task: its subtasks, in scheduler order.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::context::{
    drain_coalesced, progress_channel, ExecContext, ProgressReceiver, Settings, TaskContext,
    TaskProgressDetail,
};
use crate::error::{TaskError, TaskResult};
use crate::metrics::MetricsRecorder;
use crate::plugin::{PluginDescriptor, SubTaskMeta};
use crate::storage::{Database, DatabaseError, TaskFinish, TaskRecord, TaskStatus};

use super::config::DEFAULT_PROGRESS_CAPACITY;

/// Terminal state of one task run.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub task_id: String,
    pub status: TaskStatus,
    pub failed_sub_task: Option<String>,
    pub message: String,
    pub progress: TaskProgressDetail,
}

/// Picks the subtasks a task runs.
///
/// Without a selection every enabled-by-default subtask runs. A selection
/// must name existing subtasks. Required subtasks run either way.
pub fn select_subtasks(metas: &[SubTaskMeta], selection: &[String]) -> TaskResult<Vec<SubTaskMeta>> {
    if selection.is_empty() {
        return Ok(metas
            .iter()
            .filter(|m| m.enabled_by_default || m.required)
            .cloned()
            .collect());
    }

    if let Some(unknown) = selection
        .iter()
        .find(|name| !metas.iter().any(|m| &m.name == *name))
    {
        return Err(TaskError::NotFound(format!("subtask {}", unknown)));
    }
    Ok(metas
        .iter()
        .filter(|m| m.required || selection.contains(&m.name))
        .cloned()
        .collect())
}

/// Runs tasks against the store, one call per task.
#[derive(Clone)]
pub struct TaskRunner {
    db: Database,
    settings: Arc<Settings>,
    progress_capacity: usize,
    metrics: MetricsRecorder,
}

impl TaskRunner {
    pub fn new(db: Database, settings: Arc<Settings>) -> Self {
        Self {
            db,
            settings,
            progress_capacity: DEFAULT_PROGRESS_CAPACITY,
            metrics: MetricsRecorder::new(),
        }
    }

    pub fn with_progress_capacity(mut self, capacity: usize) -> Self {
        self.progress_capacity = capacity.max(1);
        self
    }

    /// Runs `task` to a terminal state and records it.
    ///
    /// Subtask failures become a `Failed` outcome; only bookkeeping failures
    /// of the store are returned as errors.
    pub async fn run(
        &self,
        task: &TaskRecord,
        plugin: &PluginDescriptor,
        cancel: CancellationToken,
    ) -> Result<TaskOutcome, DatabaseError> {
        let began_at = Utc::now();
        self.db.mark_task_running(&task.id, began_at).await?;

        let (tx, rx) = progress_channel(self.progress_capacity);
        let ctx = TaskContext::new(
            task.id.clone(),
            plugin.name.clone(),
            self.db.clone(),
            self.settings.clone(),
            cancel.clone(),
            Some(tx),
        );
        let consumer_done = CancellationToken::new();
        let consumer = spawn_progress_consumer(
            self.db.clone(),
            task.id.clone(),
            rx,
            consumer_done.clone(),
        );

        self.metrics.task_started();
        let mut current = None;
        let result = self
            .execute(&ctx, task, plugin, &mut current)
            .instrument(ctx.span().clone())
            .await;

        if let Some(closer) = &plugin.closer {
            if let Err(e) = closer.close(&ctx).instrument(ctx.span().clone()).await {
                warn!(task_id = %task.id, plugin = %plugin.name, error = %e, "Close hook failed");
            }
        }

        consumer_done.cancel();
        let mut progress = consumer.await.unwrap_or_default();
        let (finished, total) = ctx.progress();
        progress.finished_subtasks = finished;
        progress.total_subtasks = total;
        if let Some((name, number)) = &current {
            let (records, total_records) = ctx.sub_task_context(name).progress();
            progress.subtask_name = Some(name.clone());
            progress.subtask_number = *number;
            progress.finished_records = records;
            progress.total_records = total_records;
        }
        self.db.update_task_progress(&task.id, &progress).await?;

        let (status, failed_sub_task, message) = match &result {
            Ok(()) => (TaskStatus::Completed, None, String::new()),
            Err(e) if e.is_cancelled() || cancel.is_cancelled() => (
                TaskStatus::Cancelled,
                e.failed_subtask().map(String::from),
                e.to_string(),
            ),
            Err(e) => (
                TaskStatus::Failed,
                e.failed_subtask().map(String::from),
                e.to_string(),
            ),
        };

        let finished_at = Utc::now();
        self.db
            .finish_task(
                &task.id,
                &TaskFinish {
                    status,
                    failed_sub_task: failed_sub_task.clone(),
                    message: message.clone(),
                    finished_at,
                    spent_seconds: (finished_at - began_at).num_seconds(),
                },
            )
            .await?;
        self.metrics.task_finished();
        self.metrics.record_task(&plugin.name, status.as_str());

        match status {
            TaskStatus::Completed => info!(
                task_id = %task.id,
                plugin = %plugin.name,
                subtasks = total,
                "Task completed"
            ),
            _ => warn!(
                task_id = %task.id,
                plugin = %plugin.name,
                status = %status,
                failed_sub_task = ?failed_sub_task,
                error = %message,
                "Task did not complete"
            ),
        }

        Ok(TaskOutcome {
            task_id: task.id.clone(),
            status,
            failed_sub_task,
            message,
            progress,
        })
    }

    async fn execute(
        &self,
        ctx: &TaskContext,
        task: &TaskRecord,
        plugin: &PluginDescriptor,
        current: &mut Option<(String, u64)>,
    ) -> TaskResult<()> {
        ctx.check_cancelled()?;
        let data = plugin.task.prepare_task_data(ctx, &task.options).await?;
        ctx.set_data(data);

        let selected = select_subtasks(&plugin.task.sub_task_metas(), &task.subtasks)?;
        let ordered = plugin.sort_strategy.sort(&selected)?;
        let names: Vec<String> = ordered.iter().map(|m| m.name.clone()).collect();
        self.db.update_task_subtasks(&task.id, &names).await?;
        debug!(subtasks = ?names, strategy = %plugin.sort_strategy, "Subtasks scheduled");

        let total = ordered.len() as u64;
        ctx.set_progress(0, total);

        for (index, meta) in ordered.iter().enumerate() {
            ctx.check_cancelled()?;
            let number = index as u64 + 1;
            *current = Some((meta.name.clone(), number));
            ctx.set_current_subtask(&meta.name, number);

            let sub_ctx = ctx.sub_task_context(&meta.name);
            let clock = Instant::now();
            self.db
                .begin_subtask(&task.id, &meta.name, number as u32, meta.is_collector(), Utc::now())
                .await?;
            info!(subtask = %meta.name, number, total, "Executing subtask");

            let result = (meta.entry_point)(sub_ctx.clone())
                .instrument(sub_ctx.span().clone())
                .await;

            self.db
                .finish_subtask(&task.id, &meta.name, Utc::now(), sub_ctx.progress().0)
                .await?;
            self.metrics
                .record_subtask(&plugin.name, &meta.name, clock.elapsed());

            result.map_err(|e| TaskError::subtask(meta.name.clone(), e))?;
            ctx.inc_progress(1);
        }
        Ok(())
    }
}

/// Materializes progress notifications into the task row until `done`.
fn spawn_progress_consumer(
    db: Database,
    task_id: String,
    mut rx: ProgressReceiver,
    done: CancellationToken,
) -> JoinHandle<TaskProgressDetail> {
    tokio::spawn(async move {
        let mut detail = TaskProgressDetail::default();
        loop {
            let first = tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = done.cancelled() => break,
            };
            for event in drain_coalesced(first, &mut rx) {
                detail.apply(&event);
            }
            if let Err(e) = db.update_task_progress(&task_id, &detail).await {
                warn!(task_id = %task_id, error = %e, "Failed to persist task progress");
            }
        }
        while let Ok(event) = rx.try_recv() {
            detail.apply(&event);
        }
        detail
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::noop_entry_point;

    fn metas() -> Vec<SubTaskMeta> {
        vec![
            SubTaskMeta::new("collectIssues", noop_entry_point()),
            SubTaskMeta::new("extractIssues", noop_entry_point()),
            SubTaskMeta::new("convertAccounts", noop_entry_point()).with_enabled_by_default(false),
            SubTaskMeta::new("prepareRepo", noop_entry_point())
                .with_required(true)
                .with_enabled_by_default(false),
        ]
    }

    fn names(metas: &[SubTaskMeta]) -> Vec<&str> {
        metas.iter().map(|m| m.name.as_str()).collect()
    }

    #[test]
    fn test_default_selection() {
        let selected = select_subtasks(&metas(), &[]).unwrap();
        assert_eq!(names(&selected), vec!["collectIssues", "extractIssues", "prepareRepo"]);
    }

    #[test]
    fn test_explicit_selection_keeps_required() {
        let selected = select_subtasks(&metas(), &["convertAccounts".to_string()]).unwrap();
        assert_eq!(names(&selected), vec!["convertAccounts", "prepareRepo"]);
    }

    #[test]
    fn test_unknown_selection_is_not_found() {
        let err = select_subtasks(&metas(), &["collectPrs".to_string()]).unwrap_err();
        assert!(matches!(err, TaskError::NotFound(ref m) if m.contains("collectPrs")));
    }
}
