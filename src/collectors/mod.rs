//! Rate-limited, resumable API collection.
//!
//! A collector turns a URL template, a pagination rule and a response parser
//! into raw JSON rows stored in `_raw_<plugin>_<table>`:
//! - [`ApiCollector`]: drives pagination for every input of one scope
//! - [`AsyncApiClient`]: per-connection throttling, retries and `Retry-After` pauses
//! - [`RateLimitCalculator`]: picks the request budget, probing the first response if needed
//! - [`CollectorStateManager`]: decides incremental runs and records successful ones
//! - [`RawDataCursor`]: reads the rows of an earlier collector back as inputs

pub mod api_collector;
pub mod client;
pub mod rate_limit;
pub mod raw;
pub mod retry;
pub mod state;
pub mod types;

pub use api_collector::{ApiCollector, ApiCollectorArgs, CollectorSummary};
pub use client::{error_for_status, ApiClient, AsyncApiClient};
pub use rate_limit::{
    budget_from_headers, parse_retry_after, RateBudget, RateLimitCalculator,
    DEFAULT_REQUESTS_PER_HOUR,
};
pub use raw::{CollectorInput, ListInput, RawDataCursor, RawDataSubTaskArgs};
pub use retry::RetryPolicy;
pub use state::CollectorStateManager;
pub use types::*;
