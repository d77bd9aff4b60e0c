//! Pipeline orchestration.
//!
//! A pipeline is an ordered list of stages; each stage is a set of tasks, one
//! per plugin invocation. Stages run sequentially and the tasks of a stage run
//! concurrently, bounded by [`OrchestratorConfig::max_parallel_tasks`].
//!
//! # Components
//!
//! - **Plan**: [`PipelinePlan`] and [`TaskSpec`], parsed from JSON or YAML
//! - **Runner**: [`TaskRunner`] executes one task's subtasks in scheduler order
//! - **Orchestrator**: [`Orchestrator`] drives stages and aggregates status
//! - **Config**: [`OrchestratorConfig`], read from the environment
//!
//! # Example
//!
//! ```rust,ignore
//! use pipeforge::pipeline::{Orchestrator, OrchestratorConfig, PipelinePlan, TaskSpec};
//!
//! let plan = PipelinePlan::new(vec![
//!     vec![TaskSpec::new("github").with_options(json!({"repo": "a/b"}))],
//!     vec![TaskSpec::new("dora")],
//! ]);
//! let orchestrator = Arc::new(Orchestrator::new(db, registry, settings, OrchestratorConfig::from_env()?)?);
//! let submitted = orchestrator.submit("nightly", &plan).await?;
//! let status = submitted.handle.await??;
//! ```

pub mod config;
pub mod orchestrator;
pub mod plan;
pub mod runner;

use thiserror::Error;

use crate::context::ConfigError;
use crate::error::TaskError;
use crate::storage::DatabaseError;

pub use config::{OrchestratorConfig, DEFAULT_PROGRESS_CAPACITY};
pub use orchestrator::{compute_pipeline_status, Orchestrator, SubmittedPipeline};
pub use plan::{PipelinePlan, TaskSpec};
pub use runner::{select_subtasks, TaskOutcome, TaskRunner};

pub use crate::storage::{PipelineStatus, TaskStatus};

/// Errors that can occur during pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Pipeline {0} is already running")]
    AlreadyRunning(String),

    #[error("Pipeline {id} cannot run from state {status}")]
    NotRunnable { id: String, status: PipelineStatus },

    #[error("Task join error: {0}")]
    Join(String),
}
