//! SQLite store for pipelines, tasks, raw API data and collector state.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use super::migrations::MigrationRunner;
use super::models::{
    CollectorStateRecord, NewRawRow, NewTask, PipelineRecord, PipelineStatus, RawRow,
    SubtaskRecord, TaskFinish, TaskRecord, TaskStatus,
};
use super::schema;
use crate::context::TaskProgressDetail;
use crate::pipeline::PipelinePlan;
use crate::plugin::MigrationScript;

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] super::migrations::MigrationError),

    #[error("Invalid table name: {0}")]
    InvalidIdentifier(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Raw tables are the only dynamically named tables; guard their identifiers.
pub fn validate_raw_table(name: &str) -> Result<(), DatabaseError> {
    let valid = name.starts_with("_raw_")
        && name.len() > "_raw_".len()
        && name.len() <= 128
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(DatabaseError::InvalidIdentifier(name.to_string()))
    }
}

/// Handle to the store; cheap to clone and safe to share across tasks.
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connects to `database_url` (e.g. `sqlite::memory:` or `sqlite://data.db`).
    ///
    /// In-memory databases are pinned to a single connection so every query
    /// sees the same data.
    pub async fn connect(database_url: &str) -> Result<Self, DatabaseError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?
            .create_if_missing(true);

        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let pool_options = SqlitePoolOptions::new().acquire_timeout(Duration::from_secs(30));
        let pool_options = if in_memory {
            pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options.max_connections(8)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Fresh in-memory database with the core schema applied.
    pub async fn in_memory() -> Result<Self, DatabaseError> {
        let db = Self::connect("sqlite::memory:").await?;
        db.run_migrations().await?;
        Ok(db)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        MigrationRunner::new(self.pool.clone())
            .run_migrations()
            .await?;
        Ok(())
    }

    /// Applies a plugin's pending migration scripts; returns how many ran.
    pub async fn apply_plugin_migrations(
        &self,
        plugin: &str,
        scripts: &[MigrationScript],
    ) -> Result<usize, DatabaseError> {
        Ok(MigrationRunner::new(self.pool.clone())
            .apply_plugin_scripts(plugin, scripts)
            .await?)
    }

    // =========================================================================
    // Pipelines
    // =========================================================================

    pub async fn create_pipeline(
        &self,
        name: &str,
        plan: &PipelinePlan,
        blueprint_id: Option<&str>,
    ) -> Result<PipelineRecord, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO pipelines (id, name, plan, status, total_tasks, finished_tasks, blueprint_id, message, created_at)
            VALUES (?, ?, ?, ?, ?, 0, ?, '', ?)
            "#,
        )
        .bind(&id)
        .bind(name)
        .bind(serde_json::to_string(plan)?)
        .bind(PipelineStatus::Created.as_str())
        .bind(plan.total_tasks() as i64)
        .bind(blueprint_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_pipeline(&id).await
    }

    pub async fn get_pipeline(&self, id: &str) -> Result<PipelineRecord, DatabaseError> {
        let row = sqlx::query("SELECT * FROM pipelines WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("pipeline {}", id)))?;
        pipeline_from_row(&row)
    }

    /// Most recent pipelines first.
    pub async fn list_pipelines(&self, limit: u32) -> Result<Vec<PipelineRecord>, DatabaseError> {
        let rows = sqlx::query("SELECT * FROM pipelines ORDER BY created_at DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(pipeline_from_row).collect()
    }

    pub async fn mark_pipeline_running(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE pipelines SET status = ?, began_at = ? WHERE id = ?")
            .bind(PipelineStatus::Running.as_str())
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn increment_finished_tasks(&self, id: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE pipelines SET finished_tasks = finished_tasks + 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Writes the terminal state. Terminal pipelines are never rewritten.
    pub async fn finish_pipeline(
        &self,
        id: &str,
        status: PipelineStatus,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            r#"
            UPDATE pipelines
            SET status = ?, message = ?, finished_at = ?,
                spent_seconds = CAST((julianday(?) - julianday(COALESCE(began_at, created_at))) * 86400 AS INTEGER)
            WHERE id = ? AND status IN (?, ?)
            "#,
        )
        .bind(status.as_str())
        .bind(message)
        .bind(at)
        .bind(at)
        .bind(id)
        .bind(PipelineStatus::Created.as_str())
        .bind(PipelineStatus::Running.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("active pipeline {}", id)));
        }
        Ok(())
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    pub async fn create_task(&self, task: &NewTask) -> Result<TaskRecord, DatabaseError> {
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO tasks (id, pipeline_id, stage, plugin, options, subtasks, skip_on_fail, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&task.pipeline_id)
        .bind(task.stage as i64)
        .bind(&task.plugin)
        .bind(serde_json::to_string(&task.options)?)
        .bind(serde_json::to_string(&task.subtasks)?)
        .bind(task.skip_on_fail)
        .bind(TaskStatus::Created.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.get_task(&id).await
    }

    pub async fn get_task(&self, id: &str) -> Result<TaskRecord, DatabaseError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("task {}", id)))?;
        task_from_row(&row)
    }

    /// Tasks of a pipeline in stage then creation order.
    pub async fn list_tasks(&self, pipeline_id: &str) -> Result<Vec<TaskRecord>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE pipeline_id = ? ORDER BY stage, created_at, rowid",
        )
        .bind(pipeline_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    pub async fn mark_task_running(&self, id: &str, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE tasks SET status = ?, began_at = ? WHERE id = ?")
            .bind(TaskStatus::Running.as_str())
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Replaces the subtask list with the scheduled order.
    pub async fn update_task_subtasks(
        &self,
        id: &str,
        subtasks: &[String],
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE tasks SET subtasks = ? WHERE id = ?")
            .bind(serde_json::to_string(subtasks)?)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_task_progress(
        &self,
        id: &str,
        detail: &TaskProgressDetail,
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE tasks SET progress = ?, progress_detail = ? WHERE id = ?")
            .bind(detail.fraction())
            .bind(serde_json::to_string(detail)?)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn finish_task(&self, id: &str, finish: &TaskFinish) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?, failed_sub_task = ?, message = ?, finished_at = ?, spent_seconds = ?
            WHERE id = ?
            "#,
        )
        .bind(finish.status.as_str())
        .bind(&finish.failed_sub_task)
        .bind(&finish.message)
        .bind(finish.finished_at)
        .bind(finish.spent_seconds)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Subtask runs
    // =========================================================================

    pub async fn begin_subtask(
        &self,
        task_id: &str,
        name: &str,
        number: u32,
        is_collector: bool,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO subtasks (task_id, name, number, is_collector, began_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (task_id, name) DO UPDATE SET
                number = excluded.number,
                began_at = excluded.began_at,
                finished_at = NULL,
                spent_seconds = NULL
            "#,
        )
        .bind(task_id)
        .bind(name)
        .bind(number as i64)
        .bind(is_collector)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn finish_subtask(
        &self,
        task_id: &str,
        name: &str,
        at: DateTime<Utc>,
        finished_records: u64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            UPDATE subtasks
            SET finished_at = ?, finished_records = ?,
                spent_seconds = CAST((julianday(?) - julianday(began_at)) * 86400 AS INTEGER)
            WHERE task_id = ? AND name = ?
            "#,
        )
        .bind(at)
        .bind(finished_records as i64)
        .bind(at)
        .bind(task_id)
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_subtasks(&self, task_id: &str) -> Result<Vec<SubtaskRecord>, DatabaseError> {
        let rows = sqlx::query("SELECT * FROM subtasks WHERE task_id = ? ORDER BY number")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<SubtaskRecord, DatabaseError> {
                Ok(SubtaskRecord {
                    task_id: row.try_get("task_id")?,
                    name: row.try_get("name")?,
                    number: row.try_get::<i64, _>("number")? as u32,
                    is_collector: row.try_get("is_collector")?,
                    began_at: row.try_get("began_at")?,
                    finished_at: row.try_get("finished_at")?,
                    spent_seconds: row.try_get("spent_seconds")?,
                    finished_records: row.try_get::<i64, _>("finished_records")? as u64,
                })
            })
            .collect()
    }

    // =========================================================================
    // Raw data
    // =========================================================================

    pub async fn ensure_raw_table(&self, table: &str) -> Result<(), DatabaseError> {
        validate_raw_table(table)?;
        for statement in schema::raw_table_statements(table) {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Appends rows in one transaction; returns the number inserted.
    pub async fn insert_raw_rows(
        &self,
        table: &str,
        rows: &[NewRawRow],
    ) -> Result<u64, DatabaseError> {
        validate_raw_table(table)?;
        if rows.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            "INSERT INTO {} (params, data, url, input, created_at) VALUES (?, ?, ?, ?, ?)",
            table
        );
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(&sql)
                .bind(&row.params)
                .bind(&row.data)
                .bind(&row.url)
                .bind(&row.input)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(rows.len() as u64)
    }

    /// Removes every row collected for `params`.
    pub async fn delete_raw_rows(&self, table: &str, params: &str) -> Result<u64, DatabaseError> {
        validate_raw_table(table)?;
        let result = sqlx::query(&format!("DELETE FROM {} WHERE params = ?", table))
            .bind(params)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn count_raw_rows(&self, table: &str, params: &str) -> Result<u64, DatabaseError> {
        validate_raw_table(table)?;
        let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {} WHERE params = ?", table))
            .bind(params)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }

    /// Next `limit` rows for `params` with id greater than `after_id`.
    pub async fn fetch_raw_batch(
        &self,
        table: &str,
        params: &str,
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<RawRow>, DatabaseError> {
        validate_raw_table(table)?;
        let rows = sqlx::query(&format!(
            "SELECT id, params, data, url, input, created_at FROM {} WHERE params = ? AND id > ? ORDER BY id LIMIT ?",
            table
        ))
        .bind(params)
        .bind(after_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<RawRow, DatabaseError> {
                Ok(RawRow {
                    id: row.try_get("id")?,
                    params: row.try_get("params")?,
                    data: row.try_get("data")?,
                    url: row.try_get("url")?,
                    input: row.try_get("input")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    // =========================================================================
    // Collector state
    // =========================================================================

    pub async fn load_collector_state(
        &self,
        raw_data_table: &str,
        raw_data_params: &str,
    ) -> Result<Option<CollectorStateRecord>, DatabaseError> {
        let row = sqlx::query(
            "SELECT * FROM collector_latest_state WHERE raw_data_table = ? AND raw_data_params = ?",
        )
        .bind(raw_data_table)
        .bind(raw_data_params)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<CollectorStateRecord, DatabaseError> {
            let prev_config: String = row.try_get("prev_config")?;
            Ok(CollectorStateRecord {
                raw_data_table: row.try_get("raw_data_table")?,
                raw_data_params: row.try_get("raw_data_params")?,
                prev_started_at: row.try_get("prev_started_at")?,
                since: row.try_get("since")?,
                prev_config: serde_json::from_str(&prev_config)?,
            })
        })
        .transpose()
    }

    pub async fn save_collector_state(
        &self,
        state: &CollectorStateRecord,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO collector_latest_state (raw_data_table, raw_data_params, prev_started_at, since, prev_config, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (raw_data_table, raw_data_params) DO UPDATE SET
                prev_started_at = excluded.prev_started_at,
                since = excluded.since,
                prev_config = excluded.prev_config,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&state.raw_data_table)
        .bind(&state.raw_data_params)
        .bind(state.prev_started_at)
        .bind(state.since)
        .bind(serde_json::to_string(&state.prev_config)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn pipeline_from_row(row: &SqliteRow) -> Result<PipelineRecord, DatabaseError> {
    let plan: String = row.try_get("plan")?;
    let status: String = row.try_get("status")?;
    Ok(PipelineRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        plan: serde_json::from_str(&plan)?,
        status: PipelineStatus::from_str(&status).map_err(DatabaseError::Corrupt)?,
        total_tasks: row.try_get::<i64, _>("total_tasks")? as u64,
        finished_tasks: row.try_get::<i64, _>("finished_tasks")? as u64,
        blueprint_id: row.try_get("blueprint_id")?,
        message: row.try_get("message")?,
        created_at: row.try_get("created_at")?,
        began_at: row.try_get("began_at")?,
        finished_at: row.try_get("finished_at")?,
        spent_seconds: row.try_get("spent_seconds")?,
    })
}

fn task_from_row(row: &SqliteRow) -> Result<TaskRecord, DatabaseError> {
    let options: String = row.try_get("options")?;
    let subtasks: String = row.try_get("subtasks")?;
    let detail: String = row.try_get("progress_detail")?;
    let status: String = row.try_get("status")?;
    Ok(TaskRecord {
        id: row.try_get("id")?,
        pipeline_id: row.try_get("pipeline_id")?,
        stage: row.try_get::<i64, _>("stage")? as u32,
        plugin: row.try_get("plugin")?,
        options: serde_json::from_str(&options)?,
        subtasks: serde_json::from_str(&subtasks)?,
        skip_on_fail: row.try_get("skip_on_fail")?,
        status: TaskStatus::from_str(&status).map_err(DatabaseError::Corrupt)?,
        progress: row.try_get("progress")?,
        progress_detail: serde_json::from_str(&detail)?,
        failed_sub_task: row.try_get("failed_sub_task")?,
        message: row.try_get("message")?,
        created_at: row.try_get("created_at")?,
        began_at: row.try_get("began_at")?,
        finished_at: row.try_get("finished_at")?,
        spent_seconds: row.try_get("spent_seconds")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::TaskSpec;

    fn plan() -> PipelinePlan {
        PipelinePlan::new(vec![vec![
            TaskSpec::new("github"),
            TaskSpec::new("jira").with_skip_on_fail(true),
        ]])
    }

    #[test]
    fn test_raw_table_validation() {
        assert!(validate_raw_table("_raw_github_api_issues").is_ok());
        assert!(validate_raw_table("_raw_").is_err());
        assert!(validate_raw_table("issues").is_err());
        assert!(validate_raw_table("_raw_x; DROP TABLE tasks").is_err());
    }

    #[tokio::test]
    async fn test_pipeline_lifecycle() {
        let db = Database::in_memory().await.unwrap();
        let pipeline = db.create_pipeline("nightly", &plan(), None).await.unwrap();
        assert_eq!(pipeline.status, PipelineStatus::Created);
        assert_eq!(pipeline.total_tasks, 2);

        db.mark_pipeline_running(&pipeline.id, Utc::now()).await.unwrap();
        db.increment_finished_tasks(&pipeline.id).await.unwrap();
        db.finish_pipeline(&pipeline.id, PipelineStatus::PartialFail, "jira failed", Utc::now())
            .await
            .unwrap();

        let stored = db.get_pipeline(&pipeline.id).await.unwrap();
        assert_eq!(stored.status, PipelineStatus::PartialFail);
        assert_eq!(stored.finished_tasks, 1);
        assert_eq!(stored.plan, plan());

        // Terminal pipelines stay as they are.
        assert!(db
            .finish_pipeline(&pipeline.id, PipelineStatus::Completed, "", Utc::now())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_task_progress_and_finish() {
        let db = Database::in_memory().await.unwrap();
        let pipeline = db.create_pipeline("p", &plan(), None).await.unwrap();
        let task = db
            .create_task(&NewTask {
                pipeline_id: pipeline.id.clone(),
                stage: 1,
                plugin: "github".into(),
                options: serde_json::json!({"repo": "apache/incubator-devlake"}),
                subtasks: vec![],
                skip_on_fail: false,
            })
            .await
            .unwrap();

        let detail = TaskProgressDetail {
            finished_subtasks: 1,
            total_subtasks: 2,
            ..Default::default()
        };
        db.update_task_progress(&task.id, &detail).await.unwrap();
        db.finish_task(
            &task.id,
            &TaskFinish {
                status: TaskStatus::Failed,
                failed_sub_task: Some("extractIssues".into()),
                message: "boom".into(),
                finished_at: Utc::now(),
                spent_seconds: 3,
            },
        )
        .await
        .unwrap();

        let stored = db.get_task(&task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.failed_sub_task.as_deref(), Some("extractIssues"));
        assert!((stored.progress - 0.5).abs() < f64::EPSILON);
        assert_eq!(stored.progress_detail, detail);
        assert_eq!(db.list_tasks(&pipeline.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_raw_rows_by_params() {
        let db = Database::in_memory().await.unwrap();
        let table = "_raw_github_api_issues";
        db.ensure_raw_table(table).await.unwrap();

        let rows: Vec<NewRawRow> = (0..5)
            .map(|i| NewRawRow {
                params: if i < 3 { "a".into() } else { "b".into() },
                data: format!("{{\"n\":{}}}", i),
                url: "https://example.com".into(),
                input: None,
            })
            .collect();
        assert_eq!(db.insert_raw_rows(table, &rows).await.unwrap(), 5);
        assert_eq!(db.count_raw_rows(table, "a").await.unwrap(), 3);

        let first = db.fetch_raw_batch(table, "a", 0, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        let rest = db.fetch_raw_batch(table, "a", first[1].id, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].json().unwrap()["n"], 2);

        assert_eq!(db.delete_raw_rows(table, "a").await.unwrap(), 3);
        assert_eq!(db.count_raw_rows(table, "b").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_collector_state_upsert() {
        let db = Database::in_memory().await.unwrap();
        assert!(db
            .load_collector_state("_raw_x_y", "{}")
            .await
            .unwrap()
            .is_none());

        let mut state = CollectorStateRecord {
            raw_data_table: "_raw_x_y".into(),
            raw_data_params: "{}".into(),
            prev_started_at: Some(Utc::now()),
            since: None,
            prev_config: serde_json::json!({"page_size": 100}),
        };
        db.save_collector_state(&state).await.unwrap();
        state.prev_config = serde_json::json!({"page_size": 50});
        db.save_collector_state(&state).await.unwrap();

        let loaded = db.load_collector_state("_raw_x_y", "{}").await.unwrap().unwrap();
        assert_eq!(loaded.prev_config["page_size"], 50);
    }

    #[tokio::test]
    async fn test_plugin_migrations_apply_once() {
        let db = Database::in_memory().await.unwrap();
        let scripts = vec![MigrationScript {
            version: 20240101,
            name: "add repos".into(),
            sql: "CREATE TABLE github_repos (id TEXT PRIMARY KEY)".into(),
        }];
        assert_eq!(db.apply_plugin_migrations("github", &scripts).await.unwrap(), 1);
        assert_eq!(db.apply_plugin_migrations("github", &scripts).await.unwrap(), 0);
    }
}
