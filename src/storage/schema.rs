//! Core table definitions for the SQLite store.

use crate::plugin::MigrationScript;

pub const CREATE_PIPELINES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS pipelines (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    plan TEXT NOT NULL,
    status TEXT NOT NULL,
    total_tasks INTEGER NOT NULL DEFAULT 0,
    finished_tasks INTEGER NOT NULL DEFAULT 0,
    blueprint_id TEXT,
    message TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    began_at TEXT,
    finished_at TEXT,
    spent_seconds INTEGER
)
"#;

pub const CREATE_TASKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    pipeline_id TEXT NOT NULL REFERENCES pipelines(id),
    stage INTEGER NOT NULL,
    plugin TEXT NOT NULL,
    options TEXT NOT NULL,
    subtasks TEXT NOT NULL,
    skip_on_fail INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    progress REAL NOT NULL DEFAULT 0,
    progress_detail TEXT NOT NULL DEFAULT '{}',
    failed_sub_task TEXT,
    message TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    began_at TEXT,
    finished_at TEXT,
    spent_seconds INTEGER
)
"#;

pub const CREATE_TASKS_PIPELINE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_tasks_pipeline_id ON tasks(pipeline_id)";

pub const CREATE_SUBTASKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS subtasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL REFERENCES tasks(id),
    name TEXT NOT NULL,
    number INTEGER NOT NULL,
    is_collector INTEGER NOT NULL DEFAULT 0,
    began_at TEXT NOT NULL,
    finished_at TEXT,
    spent_seconds INTEGER,
    finished_records INTEGER NOT NULL DEFAULT 0,
    UNIQUE(task_id, name)
)
"#;

pub const CREATE_COLLECTOR_STATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS collector_latest_state (
    raw_data_table TEXT NOT NULL,
    raw_data_params TEXT NOT NULL,
    prev_started_at TEXT,
    since TEXT,
    prev_config TEXT NOT NULL DEFAULT 'null',
    updated_at TEXT NOT NULL,
    PRIMARY KEY (raw_data_table, raw_data_params)
)
"#;

/// Ledger of applied migrations; `scope` is `core` or a plugin name.
pub const CREATE_MIGRATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS _migrations (
    scope TEXT NOT NULL,
    version INTEGER NOT NULL,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL,
    PRIMARY KEY (scope, version)
)
"#;

/// Core schema as versioned scripts, in application order.
pub fn core_migrations() -> Vec<MigrationScript> {
    [
        (1, "pipelines", CREATE_PIPELINES_TABLE),
        (2, "tasks", CREATE_TASKS_TABLE),
        (3, "tasks pipeline index", CREATE_TASKS_PIPELINE_INDEX),
        (4, "subtasks", CREATE_SUBTASKS_TABLE),
        (5, "collector state", CREATE_COLLECTOR_STATE_TABLE),
    ]
    .into_iter()
    .map(|(version, name, sql)| MigrationScript {
        version,
        name: name.to_string(),
        sql: sql.to_string(),
    })
    .collect()
}

/// DDL for one raw table; `table` must already be validated.
pub fn raw_table_statements(table: &str) -> [String; 2] {
    [
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                params TEXT NOT NULL,
                data TEXT NOT NULL,
                url TEXT NOT NULL DEFAULT '',
                input TEXT,
                created_at TEXT NOT NULL
            )"
        ),
        format!("CREATE INDEX IF NOT EXISTS idx{table}_params ON {table}(params)"),
    ]
}
