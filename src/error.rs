//! Error types for pipeforge task execution.
//!
//! Each subsystem owns its own error enum:
//! - Scheduling of subtask metas ([`SchedulerError`])
//! - API collection ([`CollectorError`])
//! - Remote plugin invocation ([`BridgeError`])
//! - Persistence ([`DatabaseError`])
//!
//! [`TaskError`] folds all of them into the error a subtask entry point returns,
//! and [`TaskError::SubTask`] attaches the failing subtask's name on the way up.

use thiserror::Error;

pub use crate::bridge::BridgeError;
pub use crate::collectors::CollectorError;
pub use crate::scheduler::SchedulerError;
pub use crate::storage::DatabaseError;

/// Errors raised while preparing or running a task and its subtasks.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Bad input: {0}")]
    BadInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Collector(#[from] CollectorError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error("Task cancelled")]
    Cancelled,

    #[error("subtask {name} ended unexpectedly: {source}")]
    SubTask {
        name: String,
        #[source]
        source: Box<TaskError>,
    },
}

/// Result alias used by subtask entry points and plugin hooks.
pub type TaskResult<T> = Result<T, TaskError>;

impl TaskError {
    /// Wraps `err` with the name of the subtask that produced it.
    ///
    /// Already-wrapped errors keep their innermost subtask name.
    pub fn subtask(name: impl Into<String>, err: TaskError) -> Self {
        match err {
            wrapped @ TaskError::SubTask { .. } => wrapped,
            other => TaskError::SubTask {
                name: name.into(),
                source: Box::new(other),
            },
        }
    }

    /// Name of the subtask that failed, if the error carries one.
    pub fn failed_subtask(&self) -> Option<&str> {
        match self {
            TaskError::SubTask { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Whether the error originates from cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            TaskError::Cancelled => true,
            TaskError::Collector(CollectorError::Cancelled) => true,
            TaskError::Bridge(BridgeError::Cancelled { .. }) => true,
            TaskError::SubTask { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}
