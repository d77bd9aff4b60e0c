//! Execution contexts handed to plugin code.
//!
//! ```text
//!   TaskContext (span "task", cancellation token, task data, progress sender)
//!        │ sub_task_context(name)   (lazy, one fork per name)
//!        ▼
//!   SubTaskContext (child span "subtask", child token, own record counter)
//! ```
//!
//! Both implement [`ExecContext`], the capability set every subtask sees.
//! Task-level progress counts finished subtasks; subtask-level progress
//! counts collected or processed records.

pub mod progress;
pub mod settings;

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, Span};

use crate::error::{TaskError, TaskResult};
use crate::plugin::{downcast_task_data, TaskData};
use crate::storage::Database;

pub use progress::{
    coalesce_progress, drain_coalesced, progress_channel, ProgressCounter, ProgressReceiver,
    ProgressSender, ProgressType, RunningProgress, TaskProgressDetail,
};
pub use settings::{ConfigError, Settings};

/// Capabilities available to every subtask and plugin hook.
pub trait ExecContext: Send + Sync {
    /// Plugin name for a task, subtask name for a subtask.
    fn name(&self) -> &str;
    fn task_id(&self) -> &str;
    fn plugin(&self) -> &str;
    /// Span under which the context's logs are recorded.
    fn span(&self) -> &Span;
    fn settings(&self) -> &Settings;
    fn database(&self) -> &Database;
    fn cancellation(&self) -> &CancellationToken;
    fn task_data(&self) -> Option<TaskData>;

    fn set_progress(&self, current: u64, total: u64);
    fn inc_progress(&self, quantity: u64);
    /// Current `(current, total)` counter values.
    fn progress(&self) -> (u64, u64);

    fn is_cancelled(&self) -> bool {
        self.cancellation().is_cancelled()
    }

    fn check_cancelled(&self) -> TaskResult<()> {
        if self.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Task data downcast to the plugin's concrete type.
    fn task_data_as<T: Any + Send + Sync>(&self) -> TaskResult<Arc<T>>
    where
        Self: Sized,
    {
        let data = self
            .task_data()
            .ok_or_else(|| TaskError::Plugin("task data has not been prepared".into()))?;
        downcast_task_data(data)
    }
}

struct TaskInner {
    task_id: String,
    plugin: String,
    db: Database,
    settings: Arc<Settings>,
    cancel: CancellationToken,
    span: Span,
    data: RwLock<Option<TaskData>>,
    counter: ProgressCounter,
    progress: Option<ProgressSender>,
}

type ForkMap = Mutex<HashMap<String, SubTaskContext>>;

/// Context of one task run.
#[derive(Clone)]
pub struct TaskContext {
    inner: Arc<TaskInner>,
    forks: Arc<ForkMap>,
}

impl TaskContext {
    pub fn new(
        task_id: impl Into<String>,
        plugin: impl Into<String>,
        db: Database,
        settings: Arc<Settings>,
        cancel: CancellationToken,
        progress: Option<ProgressSender>,
    ) -> Self {
        let task_id = task_id.into();
        let plugin = plugin.into();
        let span = tracing::info_span!("task", task_id = %task_id, plugin = %plugin);
        Self {
            inner: Arc::new(TaskInner {
                task_id,
                plugin,
                db,
                settings,
                cancel,
                span,
                data: RwLock::new(None),
                counter: ProgressCounter::default(),
                progress,
            }),
            forks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn set_data(&self, data: TaskData) {
        *self.inner.data.write() = Some(data);
    }

    /// Returns the context of subtask `name`, forking it on first request.
    pub fn sub_task_context(&self, name: &str) -> SubTaskContext {
        let mut forks = self.forks.lock();
        forks
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(task_id = %self.inner.task_id, subtask = %name, "Forking subtask context");
                SubTaskContext::fork(self, name)
            })
            .clone()
    }

    /// Number of subtask contexts forked so far.
    pub fn forked_subtasks(&self) -> usize {
        self.forks.lock().len()
    }

    /// Announces the subtask about to run (1-based `number`).
    pub fn set_current_subtask(&self, name: &str, number: u64) {
        progress::emit(
            self.inner.progress.as_ref(),
            RunningProgress::new(ProgressType::SetCurrentSubTask, number, 0).for_subtask(name),
        );
    }
}

impl ExecContext for TaskContext {
    fn name(&self) -> &str {
        &self.inner.plugin
    }

    fn task_id(&self) -> &str {
        &self.inner.task_id
    }

    fn plugin(&self) -> &str {
        &self.inner.plugin
    }

    fn span(&self) -> &Span {
        &self.inner.span
    }

    fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    fn database(&self) -> &Database {
        &self.inner.db
    }

    fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    fn task_data(&self) -> Option<TaskData> {
        self.inner.data.read().clone()
    }

    fn set_progress(&self, current: u64, total: u64) {
        self.inner.counter.set(current, total);
        progress::emit(
            self.inner.progress.as_ref(),
            RunningProgress::new(ProgressType::TaskSet, current, total),
        );
    }

    fn inc_progress(&self, quantity: u64) {
        let current = self.inner.counter.add(quantity);
        progress::emit(
            self.inner.progress.as_ref(),
            RunningProgress::new(ProgressType::TaskInc, current, self.inner.counter.total()),
        );
    }

    fn progress(&self) -> (u64, u64) {
        (self.inner.counter.current(), self.inner.counter.total())
    }
}

struct SubTaskInner {
    name: String,
    // Forks are owned by the task; the back-reference must not keep them alive.
    parent: Arc<TaskInner>,
    parent_forks: Weak<ForkMap>,
    cancel: CancellationToken,
    span: Span,
    counter: ProgressCounter,
}

/// Context forked from a [`TaskContext`] for one subtask.
#[derive(Clone)]
pub struct SubTaskContext {
    inner: Arc<SubTaskInner>,
}

impl SubTaskContext {
    fn fork(parent: &TaskContext, name: &str) -> Self {
        let span = tracing::info_span!(parent: &parent.inner.span, "subtask", name = %name);
        let cancel = parent.inner.cancel.child_token();
        Self {
            inner: Arc::new(SubTaskInner {
                name: name.to_string(),
                parent: parent.inner.clone(),
                parent_forks: Arc::downgrade(&parent.forks),
                cancel,
                span,
                counter: ProgressCounter::default(),
            }),
        }
    }

    /// The owning task's context.
    pub fn task_context(&self) -> TaskContext {
        TaskContext {
            inner: self.inner.parent.clone(),
            forks: self
                .inner
                .parent_forks
                .upgrade()
                .unwrap_or_else(|| Arc::new(Mutex::new(HashMap::new()))),
        }
    }
}

impl ExecContext for SubTaskContext {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn task_id(&self) -> &str {
        &self.inner.parent.task_id
    }

    fn plugin(&self) -> &str {
        &self.inner.parent.plugin
    }

    fn span(&self) -> &Span {
        &self.inner.span
    }

    fn settings(&self) -> &Settings {
        &self.inner.parent.settings
    }

    fn database(&self) -> &Database {
        &self.inner.parent.db
    }

    fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    fn task_data(&self) -> Option<TaskData> {
        self.inner.parent.data.read().clone()
    }

    fn set_progress(&self, current: u64, total: u64) {
        self.inner.counter.set(current, total);
        progress::emit(
            self.inner.parent.progress.as_ref(),
            RunningProgress::new(ProgressType::SubTaskSet, current, total)
                .for_subtask(self.inner.name.clone()),
        );
    }

    fn inc_progress(&self, quantity: u64) {
        let current = self.inner.counter.add(quantity);
        progress::emit(
            self.inner.parent.progress.as_ref(),
            RunningProgress::new(ProgressType::SubTaskInc, current, self.inner.counter.total())
                .for_subtask(self.inner.name.clone()),
        );
    }

    fn progress(&self) -> (u64, u64) {
        (self.inner.counter.current(), self.inner.counter.total())
    }
}
