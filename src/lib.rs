//! pipeforge: staged, multi-tenant data collection pipelines.
//!
//! Plugins describe subtasks; the scheduler orders them, the orchestrator runs
//! pipeline stages of plugin tasks, and collectors pull paginated, rate-limited
//! API data into raw tables that later subtasks extract from.

pub mod bridge;
pub mod cli;
pub mod collectors;
pub mod context;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod plugin;
pub mod scheduler;
pub mod storage;

pub use error::{
    BridgeError, CollectorError, DatabaseError, SchedulerError, TaskError, TaskResult,
};
