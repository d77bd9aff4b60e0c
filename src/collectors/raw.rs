//! Raw table addressing and collector inputs.

use std::collections::VecDeque;

use async_trait::async_trait;
use serde_json::Value;

use super::types::{CollectorError, CollectorResult};
use crate::storage::{Database, RawRow};

const DEFAULT_BATCH: u32 = 500;

/// Where a collector writes: `_raw_<plugin>_<table>`, scoped by `params`.
#[derive(Debug, Clone)]
pub struct RawDataSubTaskArgs {
    pub plugin: String,
    pub table: String,
    /// Scope of the collected rows, e.g. `{"connection_id": 1, "repo": "a/b"}`.
    pub params: Value,
}

impl RawDataSubTaskArgs {
    pub fn new(plugin: impl Into<String>, table: impl Into<String>, params: Value) -> Self {
        Self {
            plugin: plugin.into(),
            table: table.into(),
            params,
        }
    }

    pub fn table_name(&self) -> String {
        format!("_raw_{}_{}", self.plugin, self.table)
    }

    /// Stable string form of `params`, stored with every row.
    pub fn fingerprint(&self) -> CollectorResult<String> {
        Ok(serde_json::to_string(&self.params)?)
    }
}

/// Source of input items for per-input collection.
#[async_trait]
pub trait CollectorInput: Send + Sync {
    /// Next item, or `None` once exhausted.
    async fn next(&mut self) -> CollectorResult<Option<Value>>;
}

/// Input backed by an in-memory list.
#[derive(Debug, Default)]
pub struct ListInput {
    items: VecDeque<Value>,
}

impl ListInput {
    pub fn new(items: Vec<Value>) -> Self {
        Self {
            items: items.into(),
        }
    }
}

impl From<Vec<Value>> for ListInput {
    fn from(items: Vec<Value>) -> Self {
        Self::new(items)
    }
}

#[async_trait]
impl CollectorInput for ListInput {
    async fn next(&mut self) -> CollectorResult<Option<Value>> {
        Ok(self.items.pop_front())
    }
}

/// Batched forward cursor over the rows of a raw table.
///
/// Rows are read in id order, `batch` at a time, so a collector can page
/// through the output of an earlier one without loading it whole.
pub struct RawDataCursor {
    db: Database,
    table: String,
    params: String,
    batch: u32,
    after_id: i64,
    buffer: VecDeque<RawRow>,
    exhausted: bool,
}

impl RawDataCursor {
    pub fn new(db: Database, args: &RawDataSubTaskArgs) -> CollectorResult<Self> {
        Ok(Self {
            db,
            table: args.table_name(),
            params: args.fingerprint()?,
            batch: DEFAULT_BATCH,
            after_id: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        })
    }

    pub fn with_batch(mut self, batch: u32) -> Self {
        self.batch = batch.max(1);
        self
    }

    /// Whether another row is available, loading the next batch if needed.
    pub async fn has_next(&mut self) -> CollectorResult<bool> {
        if self.buffer.is_empty() && !self.exhausted {
            let rows = self
                .db
                .fetch_raw_batch(&self.table, &self.params, self.after_id, self.batch)
                .await?;
            if (rows.len() as u32) < self.batch {
                self.exhausted = true;
            }
            if let Some(last) = rows.last() {
                self.after_id = last.id;
            }
            self.buffer.extend(rows);
        }
        Ok(!self.buffer.is_empty())
    }

    pub async fn fetch(&mut self) -> CollectorResult<Option<RawRow>> {
        if self.has_next().await? {
            Ok(self.buffer.pop_front())
        } else {
            Ok(None)
        }
    }
}

#[async_trait]
impl CollectorInput for RawDataCursor {
    async fn next(&mut self) -> CollectorResult<Option<Value>> {
        match self.fetch().await? {
            Some(row) => row
                .json()
                .map(Some)
                .map_err(|e| CollectorError::Parse(format!("{} row {}: {}", self.table, row.id, e))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NewRawRow;
    use serde_json::json;

    #[test]
    fn test_table_name_and_fingerprint() {
        let args = RawDataSubTaskArgs::new("github", "issues", json!({"repo": "a/b", "connection_id": 1}));
        assert_eq!(args.table_name(), "_raw_github_issues");
        assert_eq!(args.fingerprint().unwrap(), r#"{"connection_id":1,"repo":"a/b"}"#);
    }

    #[tokio::test]
    async fn test_list_input_drains_in_order() {
        let mut input = ListInput::from(vec![json!(1), json!(2)]);
        assert_eq!(input.next().await.unwrap(), Some(json!(1)));
        assert_eq!(input.next().await.unwrap(), Some(json!(2)));
        assert_eq!(input.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cursor_pages_through_rows() {
        let db = Database::in_memory().await.unwrap();
        let args = RawDataSubTaskArgs::new("github", "repos", json!({"connection_id": 1}));
        let other = RawDataSubTaskArgs::new("github", "repos", json!({"connection_id": 2}));
        db.ensure_raw_table(&args.table_name()).await.unwrap();

        let rows: Vec<NewRawRow> = (0..5)
            .map(|i| NewRawRow {
                params: args.fingerprint().unwrap(),
                data: json!({"id": i}).to_string(),
                url: format!("https://api.example.com/repos/{}", i),
                input: None,
            })
            .collect();
        db.insert_raw_rows(&args.table_name(), &rows).await.unwrap();
        db.insert_raw_rows(
            &other.table_name(),
            &[NewRawRow {
                params: other.fingerprint().unwrap(),
                data: "{}".into(),
                url: String::new(),
                input: None,
            }],
        )
        .await
        .unwrap();

        let mut cursor = RawDataCursor::new(db, &args).unwrap().with_batch(2);
        let mut seen = Vec::new();
        while let Some(item) = cursor.next().await.unwrap() {
            seen.push(item["id"].as_i64().unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert!(!cursor.has_next().await.unwrap());
    }
}
