//! Persisted entities.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::TaskProgressDetail;
use crate::pipeline::PipelinePlan;

/// Lifecycle of a task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "TASK_CREATED",
            TaskStatus::Running => "TASK_RUNNING",
            TaskStatus::Completed => "TASK_COMPLETED",
            TaskStatus::Failed => "TASK_FAILED",
            TaskStatus::Cancelled => "TASK_CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TASK_CREATED" => Ok(TaskStatus::Created),
            "TASK_RUNNING" => Ok(TaskStatus::Running),
            "TASK_COMPLETED" => Ok(TaskStatus::Completed),
            "TASK_FAILED" => Ok(TaskStatus::Failed),
            "TASK_CANCELLED" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// Lifecycle of a pipeline record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStatus {
    Created,
    Running,
    Completed,
    PartialFail,
    Failed,
    Cancelled,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Created => "TASK_CREATED",
            PipelineStatus::Running => "TASK_RUNNING",
            PipelineStatus::Completed => "TASK_COMPLETED",
            PipelineStatus::PartialFail => "TASK_PARTIAL",
            PipelineStatus::Failed => "TASK_FAILED",
            PipelineStatus::Cancelled => "TASK_CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PipelineStatus::Created | PipelineStatus::Running)
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TASK_CREATED" => Ok(PipelineStatus::Created),
            "TASK_RUNNING" => Ok(PipelineStatus::Running),
            "TASK_COMPLETED" => Ok(PipelineStatus::Completed),
            "TASK_PARTIAL" => Ok(PipelineStatus::PartialFail),
            "TASK_FAILED" => Ok(PipelineStatus::Failed),
            "TASK_CANCELLED" => Ok(PipelineStatus::Cancelled),
            other => Err(format!("unknown pipeline status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineRecord {
    pub id: String,
    pub name: String,
    pub plan: PipelinePlan,
    pub status: PipelineStatus,
    pub total_tasks: u64,
    pub finished_tasks: u64,
    pub blueprint_id: Option<String>,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub began_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub spent_seconds: Option<i64>,
}

impl PipelineRecord {
    /// Share of tasks that reached a terminal state, in percent.
    pub fn progress_percent(&self) -> f64 {
        if self.total_tasks == 0 {
            return 0.0;
        }
        self.finished_tasks as f64 * 100.0 / self.total_tasks as f64
    }
}

/// Values needed to insert a task row.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub pipeline_id: String,
    pub stage: u32,
    pub plugin: String,
    pub options: serde_json::Value,
    pub subtasks: Vec<String>,
    pub skip_on_fail: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: String,
    pub pipeline_id: String,
    pub stage: u32,
    pub plugin: String,
    pub options: serde_json::Value,
    pub subtasks: Vec<String>,
    pub skip_on_fail: bool,
    pub status: TaskStatus,
    pub progress: f64,
    pub progress_detail: TaskProgressDetail,
    pub failed_sub_task: Option<String>,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub began_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub spent_seconds: Option<i64>,
}

/// Terminal outcome written to a task row.
#[derive(Debug, Clone)]
pub struct TaskFinish {
    pub status: TaskStatus,
    pub failed_sub_task: Option<String>,
    pub message: String,
    pub finished_at: DateTime<Utc>,
    pub spent_seconds: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubtaskRecord {
    pub task_id: String,
    pub name: String,
    pub number: u32,
    pub is_collector: bool,
    pub began_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub spent_seconds: Option<i64>,
    pub finished_records: u64,
}

/// A row to append to a raw table.
#[derive(Debug, Clone)]
pub struct NewRawRow {
    pub params: String,
    pub data: String,
    pub url: String,
    pub input: Option<String>,
}

/// A stored raw API item.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub id: i64,
    pub params: String,
    pub data: String,
    pub url: String,
    pub input: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RawRow {
    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.data)
    }
}

/// Latest successful collection for one raw table and scope.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectorStateRecord {
    pub raw_data_table: String,
    pub raw_data_params: String,
    pub prev_started_at: Option<DateTime<Utc>>,
    pub since: Option<DateTime<Utc>>,
    pub prev_config: serde_json::Value,
}
