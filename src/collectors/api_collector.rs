//! Paginated API collection into raw tables.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, FuturesUnordered, StreamExt, TryStreamExt};
use serde_json::{json, Value};
use tera::{Context, Tera};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::client::AsyncApiClient;
use super::raw::{CollectorInput, RawDataSubTaskArgs};
use super::state::CollectorStateManager;
use super::types::{
    ApiResponse, CollectorError, CollectorResult, HeaderBuilder, NextPage, NextPageFn, Pager,
    QueryBuilder, RequestData, ResponseParser, TotalPagesFn,
};
use crate::context::{ExecContext, SubTaskContext};
use crate::storage::{Database, NewRawRow};

const URL_TEMPLATE: &str = "url";

/// Configuration of one collection.
pub struct ApiCollectorArgs {
    pub raw: RawDataSubTaskArgs,
    pub client: Arc<AsyncApiClient>,
    /// Tera template rendered with `pager`, `params`, `input`, `custom_data` and `since`.
    pub url_template: String,
    /// Items per page; 0 sends one request per input.
    pub page_size: u64,
    /// Inputs or pages in flight; 0 uses the client's worker budget.
    pub concurrency: usize,
    pub incremental: bool,
    pub input: Option<Box<dyn CollectorInput>>,
    pub query: Option<QueryBuilder>,
    pub header: Option<HeaderBuilder>,
    pub response_parser: ResponseParser,
    pub get_next_page_custom_data: Option<NextPageFn>,
    pub get_total_pages: Option<TotalPagesFn>,
}

impl ApiCollectorArgs {
    pub fn new(
        raw: RawDataSubTaskArgs,
        client: Arc<AsyncApiClient>,
        url_template: impl Into<String>,
        response_parser: ResponseParser,
    ) -> Self {
        Self {
            raw,
            client,
            url_template: url_template.into(),
            page_size: 0,
            concurrency: 0,
            incremental: false,
            input: None,
            query: None,
            header: None,
            response_parser,
            get_next_page_custom_data: None,
            get_total_pages: None,
        }
    }

    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }

    pub fn with_input(mut self, input: impl CollectorInput + 'static) -> Self {
        self.input = Some(Box::new(input));
        self
    }

    pub fn with_query(mut self, query: QueryBuilder) -> Self {
        self.query = Some(query);
        self
    }

    pub fn with_header(mut self, header: HeaderBuilder) -> Self {
        self.header = Some(header);
        self
    }

    /// Cursor pagination: pages are fetched one after another per input.
    pub fn with_next_page(mut self, next: NextPageFn) -> Self {
        self.get_next_page_custom_data = Some(next);
        self
    }

    /// Page count read from the first response; remaining pages run concurrently.
    pub fn with_total_pages(mut self, total: TotalPagesFn) -> Self {
        self.get_total_pages = Some(total);
        self
    }
}

/// Counts reported by a finished collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorSummary {
    pub requests: u64,
    pub records: u64,
    /// Rows removed before a full sweep.
    pub deleted: u64,
    pub incremental: bool,
}

/// Drives requests for one raw table and scope.
pub struct ApiCollector {
    args: ApiCollectorArgs,
    templates: Tera,
}

impl std::fmt::Debug for ApiCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCollector")
            .field("table", &self.args.raw.table_name())
            .field("url_template", &self.args.url_template)
            .field("page_size", &self.args.page_size)
            .finish()
    }
}

impl ApiCollector {
    pub fn new(args: ApiCollectorArgs) -> CollectorResult<Self> {
        if args.url_template.trim().is_empty() {
            return Err(CollectorError::InvalidConfig("url_template is empty".into()));
        }
        if args.get_next_page_custom_data.is_some() && args.get_total_pages.is_some() {
            return Err(CollectorError::InvalidConfig(
                "cursor pagination and total pages are mutually exclusive".into(),
            ));
        }
        if args.get_total_pages.is_some() && args.page_size == 0 {
            return Err(CollectorError::InvalidConfig(
                "total pages requires a page size".into(),
            ));
        }

        let mut templates = Tera::default();
        templates
            .add_raw_template(URL_TEMPLATE, &args.url_template)
            .map_err(|e| CollectorError::Template(e.to_string()))?;

        Ok(Self { args, templates })
    }

    /// Runs the collection to completion, cancellation or the first hard error.
    pub async fn execute(mut self, ctx: &SubTaskContext) -> CollectorResult<CollectorSummary> {
        let db = ctx.database().clone();
        let table = self.args.raw.table_name();
        let params = self.args.raw.fingerprint()?;
        db.ensure_raw_table(&table).await?;

        let state = CollectorStateManager::load(
            &db,
            &table,
            &params,
            self.state_config(),
            self.args.incremental,
            Utc::now(),
        )
        .await?;
        let deleted = if state.is_incremental() {
            0
        } else {
            db.delete_raw_rows(&table, &params).await?
        };
        info!(
            table = %table,
            incremental = state.is_incremental(),
            deleted,
            "Starting API collection"
        );

        let input = self.args.input.take();
        let limit = match self.args.concurrency {
            0 => self.args.client.max_workers(),
            n => n,
        };
        let run = Run {
            args: &self.args,
            templates: &self.templates,
            ctx,
            db: &db,
            table: &table,
            params_fingerprint: &params,
            since: state.since(),
            cancel: ctx.cancellation(),
            limit: limit.max(1),
            requests: AtomicU64::new(0),
            records: AtomicU64::new(0),
        };

        match input {
            None => run.collect_input(None).await?,
            Some(mut input) => {
                let mut in_flight = FuturesUnordered::new();
                let mut exhausted = false;
                loop {
                    while !exhausted && in_flight.len() < run.limit {
                        match input.next().await? {
                            Some(item) => in_flight.push(run.collect_input(Some(item))),
                            None => exhausted = true,
                        }
                    }
                    match in_flight.next().await {
                        Some(result) => result?,
                        None => break,
                    }
                }
            }
        }

        state.save(&db).await?;
        let summary = CollectorSummary {
            requests: run.requests.load(Ordering::Relaxed),
            records: run.records.load(Ordering::Relaxed),
            deleted,
            incremental: state.is_incremental(),
        };
        info!(
            table = %table,
            requests = summary.requests,
            records = summary.records,
            "API collection finished"
        );
        Ok(summary)
    }

    fn state_config(&self) -> Value {
        json!({
            "url_template": self.args.url_template,
            "page_size": self.args.page_size,
        })
    }
}

struct Run<'a> {
    args: &'a ApiCollectorArgs,
    templates: &'a Tera,
    ctx: &'a SubTaskContext,
    db: &'a Database,
    table: &'a str,
    params_fingerprint: &'a str,
    since: Option<DateTime<Utc>>,
    cancel: &'a CancellationToken,
    limit: usize,
    requests: AtomicU64,
    records: AtomicU64,
}

impl Run<'_> {
    fn request_data(
        &self,
        pager: Option<Pager>,
        input: Option<Value>,
        custom_data: Option<Value>,
    ) -> RequestData {
        RequestData {
            pager,
            params: self.args.raw.params.clone(),
            input,
            custom_data,
            since: self.since,
        }
    }

    async fn collect_input(&self, input: Option<Value>) -> CollectorResult<()> {
        if let Some(next_page) = &self.args.get_next_page_custom_data {
            return self.collect_by_cursor(input, next_page).await;
        }
        if self.args.page_size == 0 {
            let req = self.request_data(None, input, None);
            return self.fetch_page(&req).await.map(|_| ());
        }
        match &self.args.get_total_pages {
            Some(total_pages) => self.collect_determined(input, total_pages).await,
            None => self.collect_undetermined(input).await,
        }
    }

    async fn collect_by_cursor(
        &self,
        input: Option<Value>,
        next_page: &NextPageFn,
    ) -> CollectorResult<()> {
        let mut custom_data = None;
        let mut page = 1;
        loop {
            let pager = (self.args.page_size > 0).then(|| Pager::new(page, self.args.page_size));
            let req = self.request_data(pager, input.clone(), custom_data.take());
            let (res, _) = self.fetch_page(&req).await?;
            match next_page(&req, &res)? {
                NextPage::Next(data) => {
                    custom_data = Some(data);
                    page += 1;
                }
                NextPage::Finish => return Ok(()),
            }
        }
    }

    async fn collect_determined(
        &self,
        input: Option<Value>,
        total_pages: &TotalPagesFn,
    ) -> CollectorResult<()> {
        let size = self.args.page_size;
        let first = self.request_data(Some(Pager::new(1, size)), input.clone(), None);
        let (res, _) = self.fetch_page(&first).await?;
        let total = total_pages(&res, size)?;
        debug!(table = %self.table, total_pages = total, "Page count determined");

        stream::iter(2..=total)
            .map(|page| {
                let req = self.request_data(Some(Pager::new(page, size)), input.clone(), None);
                async move { self.fetch_page(&req).await.map(|_| ()) }
            })
            .buffer_unordered(self.limit)
            .try_for_each(|_| futures::future::ready(Ok(())))
            .await
    }

    async fn collect_undetermined(&self, input: Option<Value>) -> CollectorResult<()> {
        let size = self.args.page_size;
        let mut page = 1;
        loop {
            let wave = page..page + self.limit as u64;
            page = wave.end;
            let counts: Vec<usize> = stream::iter(wave)
                .map(|page| {
                    let req = self.request_data(Some(Pager::new(page, size)), input.clone(), None);
                    async move { self.fetch_page(&req).await.map(|(_, count)| count) }
                })
                .buffered(self.limit)
                .try_collect()
                .await?;
            if counts.iter().any(|&count| (count as u64) < size) {
                return Ok(());
            }
        }
    }

    /// Sends one request, stores its items and reports them as progress.
    async fn fetch_page(&self, req: &RequestData) -> CollectorResult<(ApiResponse, usize)> {
        if self.cancel.is_cancelled() {
            return Err(CollectorError::Cancelled);
        }

        let context =
            Context::from_serialize(req).map_err(|e| CollectorError::Template(e.to_string()))?;
        let path = self
            .templates
            .render(URL_TEMPLATE, &context)
            .map_err(|e| CollectorError::Template(e.to_string()))?;
        let query = match &self.args.query {
            Some(build) => build(req)?,
            None => Vec::new(),
        };
        let headers = match &self.args.header {
            Some(build) => build(req)?,
            None => Vec::new(),
        };

        let res = self.args.client.get(&path, &query, &headers, self.cancel).await?;
        self.requests.fetch_add(1, Ordering::Relaxed);
        let items = (self.args.response_parser)(&res)?;

        let input = req.input.as_ref().map(Value::to_string);
        let rows: Vec<NewRawRow> = items
            .iter()
            .map(|item| NewRawRow {
                params: self.params_fingerprint.to_string(),
                data: item.to_string(),
                url: res.url.clone(),
                input: input.clone(),
            })
            .collect();
        let saved = self.db.insert_raw_rows(self.table, &rows).await?;
        self.records.fetch_add(saved, Ordering::Relaxed);
        if saved > 0 {
            self.ctx.inc_progress(saved);
        }

        debug!(url = %res.url, items = items.len(), "Page collected");
        Ok((res, items.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::{json_array_parser, ApiClient, RateLimitCalculator, RetryPolicy};
    use std::time::Duration;

    fn client() -> Arc<AsyncApiClient> {
        let api = ApiClient::new("http://127.0.0.1:9", Duration::from_secs(1)).unwrap();
        Arc::new(
            AsyncApiClient::new(api, RateLimitCalculator::new(Some(3600), None), RetryPolicy::immediate(0))
                .unwrap(),
        )
    }

    fn raw() -> RawDataSubTaskArgs {
        RawDataSubTaskArgs::new("demo", "items", json!({"repo": "a/b"}))
    }

    #[test]
    fn test_rejects_conflicting_pagination() {
        let args = ApiCollectorArgs::new(raw(), client(), "items", json_array_parser())
            .with_page_size(10)
            .with_next_page(Arc::new(|_: &RequestData, _: &ApiResponse| {
                Ok::<_, CollectorError>(NextPage::Finish)
            }))
            .with_total_pages(Arc::new(|_: &ApiResponse, _: u64| Ok::<_, CollectorError>(1)));
        assert!(matches!(ApiCollector::new(args), Err(CollectorError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_bad_template() {
        let args = ApiCollectorArgs::new(raw(), client(), "repos/{{ params.repo", json_array_parser());
        assert!(matches!(ApiCollector::new(args), Err(CollectorError::Template(_))));

        let args = ApiCollectorArgs::new(raw(), client(), "  ", json_array_parser());
        assert!(matches!(ApiCollector::new(args), Err(CollectorError::InvalidConfig(_))));
    }

    #[test]
    fn test_template_sees_request_data() {
        let args = ApiCollectorArgs::new(
            raw(),
            client(),
            "repos/{{ params.repo }}/issues/{{ input.number }}?page={{ pager.page }}&skip={{ pager.skip }}",
            json_array_parser(),
        );
        let collector = ApiCollector::new(args).unwrap();
        let req = RequestData {
            pager: Some(Pager::new(3, 20)),
            params: json!({"repo": "a/b"}),
            input: Some(json!({"number": 7})),
            custom_data: None,
            since: None,
        };
        let rendered = collector
            .templates
            .render(URL_TEMPLATE, &Context::from_serialize(&req).unwrap())
            .unwrap();
        assert_eq!(rendered, "repos/a/b/issues/7?page=3&skip=40");
    }
}
