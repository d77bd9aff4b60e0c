//! Shared collector types: errors, pager state, request data and callbacks.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::storage::DatabaseError;

/// Errors that can occur during data collection operations.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// HTTP 429, or a 403 that carries quota headers.
    #[error("Rate limited: retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unprocessable request: {0}")]
    Unprocessable(String),

    /// Any other non-2xx status; 5xx is retryable.
    #[error("Upstream returned HTTP {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Malformed response body.
    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Invalid collector configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Collection cancelled")]
    Cancelled,
}

impl CollectorError {
    /// Whether the request may succeed if sent again.
    pub fn is_retryable(&self) -> bool {
        match self {
            CollectorError::RateLimited { .. } => true,
            CollectorError::Upstream { status, .. } => *status >= 500 || *status == 408,
            CollectorError::Http(e) => !e.is_builder() && !e.is_decode(),
            _ => false,
        }
    }
}

/// Result type alias for collector operations.
pub type CollectorResult<T> = Result<T, CollectorError>;

/// Page position passed to URL templates and query builders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pager {
    /// 1-based page number.
    pub page: u64,
    pub size: u64,
    /// Items before this page, `(page - 1) * size`.
    pub skip: u64,
}

impl Pager {
    pub fn new(page: u64, size: u64) -> Self {
        Self {
            page,
            size,
            skip: page.saturating_sub(1) * size,
        }
    }
}

/// Everything known when building one request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestData {
    pub pager: Option<Pager>,
    pub params: Value,
    pub input: Option<Value>,
    pub custom_data: Option<Value>,
    pub since: Option<DateTime<Utc>>,
}

/// Decision of a cursor pagination callback.
#[derive(Debug, Clone, PartialEq)]
pub enum NextPage {
    Next(Value),
    Finish,
}

/// A fully read HTTP response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub url: String,
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Decodes the body; a malformed body is a [`CollectorError::Parse`].
    pub fn json<T: DeserializeOwned>(&self) -> CollectorResult<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| CollectorError::Parse(format!("{}: {}", self.url, e)))
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub type QueryBuilder =
    Arc<dyn Fn(&RequestData) -> CollectorResult<Vec<(String, String)>> + Send + Sync>;
pub type HeaderBuilder =
    Arc<dyn Fn(&RequestData) -> CollectorResult<Vec<(String, String)>> + Send + Sync>;
pub type ResponseParser = Arc<dyn Fn(&ApiResponse) -> CollectorResult<Vec<Value>> + Send + Sync>;
pub type NextPageFn =
    Arc<dyn Fn(&RequestData, &ApiResponse) -> CollectorResult<NextPage> + Send + Sync>;
pub type TotalPagesFn = Arc<dyn Fn(&ApiResponse, u64) -> CollectorResult<u64> + Send + Sync>;

/// Parser for endpoints that answer with a bare JSON array.
pub fn json_array_parser() -> ResponseParser {
    Arc::new(|res: &ApiResponse| res.json::<Vec<Value>>())
}

/// Parser for endpoints that wrap their items in an object field.
pub fn json_field_parser(field: &'static str) -> ResponseParser {
    Arc::new(move |res: &ApiResponse| {
        let body: Value = res.json()?;
        match body.get(field) {
            Some(Value::Array(items)) => Ok(items.clone()),
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(other) => Err(CollectorError::Parse(format!(
                "{}: field '{}' is not an array but {}",
                res.url, field, other
            ))),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(body: &str) -> ApiResponse {
        ApiResponse {
            url: "https://api.example.com/items".into(),
            status: 200,
            headers: HeaderMap::new(),
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_pager_skip() {
        assert_eq!(Pager::new(1, 50).skip, 0);
        assert_eq!(Pager::new(3, 50).skip, 100);
    }

    #[test]
    fn test_parsers() {
        let items = json_array_parser()(&response("[1,2,3]")).unwrap();
        assert_eq!(items.len(), 3);

        let items = json_field_parser("values")(&response(r#"{"values":[{"id":1}]}"#)).unwrap();
        assert_eq!(items[0]["id"], 1);

        let err = json_array_parser()(&response("<html>")).unwrap_err();
        assert!(matches!(err, CollectorError::Parse(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(CollectorError::RateLimited { retry_after: None }.is_retryable());
        assert!(CollectorError::Upstream { status: 502, body: String::new() }.is_retryable());
        assert!(!CollectorError::Upstream { status: 400, body: String::new() }.is_retryable());
        assert!(!CollectorError::NotFound("x".into()).is_retryable());
        assert!(!CollectorError::Forbidden("x".into()).is_retryable());
    }
}
