//! Schema migrations for the core tables and for plugin-owned tables.
//!
//! Both kinds go through the same ledger (`_migrations`), keyed by scope and
//! version. The core schema uses the `core` scope; plugin scripts use the
//! plugin name, so two plugins may reuse a version number.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::debug;

use super::schema;
use crate::plugin::MigrationScript;

/// Scope of the built-in schema in the ledger.
pub const CORE_SCOPE: &str = "core";

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration {scope} v{version} ({name}) failed: {source}")]
    Script {
        scope: String,
        version: u64,
        name: String,
        #[source]
        source: sqlx::Error,
    },
}

/// Applies versioned scripts exactly once per scope.
pub struct MigrationRunner {
    pool: SqlitePool,
}

impl MigrationRunner {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Brings the core schema up to date. Returns how many scripts ran.
    pub async fn run_migrations(&self) -> Result<usize, MigrationError> {
        self.apply(CORE_SCOPE, &schema::core_migrations()).await
    }

    /// Applies the scripts of `plugin` that were not applied yet.
    pub async fn apply_plugin_scripts(
        &self,
        plugin: &str,
        scripts: &[MigrationScript],
    ) -> Result<usize, MigrationError> {
        self.apply(plugin, scripts).await
    }

    /// Ledger entries for `scope`, oldest version first.
    pub async fn applied(&self, scope: &str) -> Result<Vec<AppliedMigration>, MigrationError> {
        sqlx::query(schema::CREATE_MIGRATIONS_TABLE)
            .execute(&self.pool)
            .await?;
        let rows = sqlx::query_as(
            "SELECT scope, version, name, applied_at FROM _migrations WHERE scope = ? ORDER BY version",
        )
        .bind(scope)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn apply(&self, scope: &str, scripts: &[MigrationScript]) -> Result<usize, MigrationError> {
        let done: HashSet<u64> = self
            .applied(scope)
            .await?
            .into_iter()
            .map(|m| m.version as u64)
            .collect();

        let mut pending: Vec<&MigrationScript> =
            scripts.iter().filter(|s| !done.contains(&s.version)).collect();
        pending.sort_by_key(|s| s.version);

        for script in &pending {
            // Script and ledger row commit together, so a failed script is retried next time.
            let mut tx = self.pool.begin().await?;
            sqlx::query(&script.sql)
                .execute(&mut *tx)
                .await
                .map_err(|source| MigrationError::Script {
                    scope: scope.to_string(),
                    version: script.version,
                    name: script.name.clone(),
                    source,
                })?;
            sqlx::query("INSERT INTO _migrations (scope, version, name, applied_at) VALUES (?, ?, ?, ?)")
                .bind(scope)
                .bind(script.version as i64)
                .bind(&script.name)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;

            debug!(scope = %scope, version = script.version, name = %script.name, "Applied migration");
        }
        Ok(pending.len())
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppliedMigration {
    pub scope: String,
    pub version: i64,
    pub name: String,
    pub applied_at: DateTime<Utc>,
}
