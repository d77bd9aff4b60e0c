//! Incremental collection state.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};

use super::types::CollectorResult;
use crate::storage::{CollectorStateRecord, Database};

/// Decides whether a run is incremental and records successful runs.
///
/// A run is incremental only when it was asked to be, a previous successful
/// run exists for the same table and scope, and that run used the same
/// configuration. An incremental run collects items changed since the
/// previous run started.
#[derive(Debug, Clone)]
pub struct CollectorStateManager {
    table: String,
    params: String,
    config: Value,
    started_at: DateTime<Utc>,
    previous: Option<CollectorStateRecord>,
    incremental: bool,
}

impl CollectorStateManager {
    pub async fn load(
        db: &Database,
        table: &str,
        params: &str,
        config: Value,
        incremental_requested: bool,
        now: DateTime<Utc>,
    ) -> CollectorResult<Self> {
        let previous = db.load_collector_state(table, params).await?;
        let incremental = incremental_requested
            && previous
                .as_ref()
                .is_some_and(|state| state.prev_started_at.is_some() && state.prev_config == config);

        if incremental_requested && !incremental {
            info!(table, "Previous collection missing or configured differently, collecting in full");
        }
        debug!(table, incremental, "Collector state loaded");

        Ok(Self {
            table: table.to_string(),
            params: params.to_string(),
            config,
            started_at: now,
            previous,
            incremental,
        })
    }

    pub fn is_incremental(&self) -> bool {
        self.incremental
    }

    /// Lower bound for an incremental run.
    pub fn since(&self) -> Option<DateTime<Utc>> {
        if !self.incremental {
            return None;
        }
        self.previous.as_ref().and_then(|s| s.prev_started_at)
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Records this run as the latest successful one.
    pub async fn save(&self, db: &Database) -> CollectorResult<()> {
        db.save_collector_state(&CollectorStateRecord {
            raw_data_table: self.table.clone(),
            raw_data_params: self.params.clone(),
            prev_started_at: Some(self.started_at),
            since: self.since(),
            prev_config: self.config.clone(),
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[tokio::test]
    async fn test_incremental_requires_matching_previous_run() {
        let db = Database::in_memory().await.unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let config = json!({"page_size": 100});

        let first = CollectorStateManager::load(&db, "_raw_x_items", "{}", config.clone(), true, t1)
            .await
            .unwrap();
        assert!(!first.is_incremental());
        assert_eq!(first.since(), None);
        first.save(&db).await.unwrap();

        let second = CollectorStateManager::load(&db, "_raw_x_items", "{}", config.clone(), true, t2)
            .await
            .unwrap();
        assert!(second.is_incremental());
        assert_eq!(second.since(), Some(t1));

        let changed = CollectorStateManager::load(&db, "_raw_x_items", "{}", json!({"page_size": 50}), true, t2)
            .await
            .unwrap();
        assert!(!changed.is_incremental());

        let full = CollectorStateManager::load(&db, "_raw_x_items", "{}", config, false, t2)
            .await
            .unwrap();
        assert!(!full.is_incremental());
    }
}
