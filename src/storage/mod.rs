//! Persistent storage.
//!
//! The store is treated as an opaque CRUD + cursor + schema-evolution
//! service. It is backed by SQLite through `sqlx` and holds:
//! - **Pipelines** and their **tasks** (terminal records are kept as an audit trail)
//! - **Subtask runs** with timings
//! - **Raw tables** (`_raw_<plugin>_<entity>`) written by collectors
//! - **Collector state** used for incremental collection
//! - **Migrations** for the core schema and for plugin-owned tables
//!
//! # Usage
//!
//! ```rust,ignore
//! use pipeforge::storage::Database;
//!
//! let db = Database::connect("sqlite://pipeforge.db").await?;
//! db.run_migrations().await?;
//! let pipelines = db.list_pipelines(20).await?;
//! ```

pub mod database;
pub mod migrations;
pub mod models;
pub mod schema;

pub use database::{validate_raw_table, Database, DatabaseError};
pub use migrations::{AppliedMigration, MigrationError, MigrationRunner, CORE_SCOPE};
pub use models::{
    CollectorStateRecord, NewRawRow, NewTask, PipelineRecord, PipelineStatus, RawRow,
    SubtaskRecord, TaskFinish, TaskRecord, TaskStatus,
};
