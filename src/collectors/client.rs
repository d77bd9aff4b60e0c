//! HTTP clients used by collectors.
//!
//! [`ApiClient`] sends plain requests against one endpoint. [`AsyncApiClient`]
//! wraps it with the connection's request budget: a token bucket refilled
//! every tick interval, a worker semaphore bounding requests in flight, a
//! client-wide pause honoured after `Retry-After`, and bounded retries.
//! Each connection owns its own `AsyncApiClient`, so throttling one never
//! slows another.

use std::num::NonZeroU32;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::rate_limit::{budget_from_headers, parse_retry_after, RateBudget, RateLimitCalculator, DEFAULT_REQUESTS_PER_HOUR};
use super::retry::RetryPolicy;
use super::types::{ApiResponse, CollectorError, CollectorResult};
use crate::context::settings::{self, Settings};
use crate::metrics::MetricsRecorder;

const ERROR_BODY_LIMIT: usize = 512;

/// Plain HTTP client bound to one API endpoint.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    endpoint: String,
    headers: HeaderMap,
}

impl ApiClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> CollectorResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("pipeforge/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            headers: HeaderMap::new(),
        })
    }

    /// Client with the timeout from `API_TIMEOUT`.
    pub fn from_settings(endpoint: impl Into<String>, settings: &Settings) -> CollectorResult<Self> {
        let timeout = settings
            .get_duration_secs(settings::API_TIMEOUT, Duration::from_secs(120))
            .map_err(|e| CollectorError::InvalidConfig(e.to_string()))?;
        Self::new(endpoint, timeout)
    }

    /// Adds a header sent with every request.
    pub fn with_header(mut self, name: &str, value: &str) -> CollectorResult<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| CollectorError::InvalidConfig(format!("header {}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| CollectorError::InvalidConfig(format!("header {}: {}", name, e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn with_bearer_token(self, token: &str) -> CollectorResult<Self> {
        self.with_header("Authorization", &format!("Bearer {}", token))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Absolute URL for `path` with `query` appended.
    pub fn resolve_url(&self, path: &str, query: &[(String, String)]) -> String {
        let mut url = if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.endpoint, path.trim_start_matches('/'))
        };
        if !query.is_empty() {
            let encoded: Vec<String> = query
                .iter()
                .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
                .collect();
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(&encoded.join("&"));
        }
        url
    }

    /// Sends a GET request and reads the whole body, whatever the status.
    pub async fn get(
        &self,
        path: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
    ) -> CollectorResult<ApiResponse> {
        let url = self.resolve_url(path, query);
        let mut request = self.http.get(&url).headers(self.headers.clone());
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        debug!(url = %url, status, bytes = body.len(), "API response");
        Ok(ApiResponse {
            url,
            status,
            headers,
            body,
        })
    }
}

/// Maps a non-2xx response to a typed error.
pub fn error_for_status(res: &ApiResponse, now: DateTime<Utc>) -> Option<CollectorError> {
    if res.is_success() {
        return None;
    }

    let retry_after = res
        .header("retry-after")
        .and_then(|v| parse_retry_after(v, now));
    let quota_exhausted = res.header("x-ratelimit-remaining").map(str::trim) == Some("0");
    let mut body = res.text();
    if body.len() > ERROR_BODY_LIMIT {
        let mut cut = ERROR_BODY_LIMIT;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }

    Some(match res.status {
        429 => CollectorError::RateLimited { retry_after },
        403 if retry_after.is_some() || quota_exhausted => CollectorError::RateLimited {
            retry_after: retry_after
                .or_else(|| budget_from_headers(&res.headers, now).map(|b| b.window)),
        },
        403 => CollectorError::Forbidden(format!("{}: {}", res.url, body)),
        404 => CollectorError::NotFound(res.url.clone()),
        422 => CollectorError::Unprocessable(format!("{}: {}", res.url, body)),
        status => CollectorError::Upstream { status, body },
    })
}

struct Throttle {
    budget: RateBudget,
    limiter: DefaultDirectRateLimiter,
    workers: Arc<Semaphore>,
}

impl Throttle {
    fn new(budget: RateBudget) -> CollectorResult<Self> {
        let workers = budget.workers();
        let burst = NonZeroU32::new(workers as u32).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::with_period(budget.tick_interval())
            .ok_or_else(|| CollectorError::InvalidConfig("rate limit interval is zero".into()))?
            .allow_burst(burst);
        Ok(Self {
            budget,
            limiter: RateLimiter::direct(quota),
            workers: Arc::new(Semaphore::new(workers)),
        })
    }
}

/// Rate-limited, retrying client for one connection.
pub struct AsyncApiClient {
    client: ApiClient,
    calculator: RateLimitCalculator,
    retry: RetryPolicy,
    throttle: OnceLock<Throttle>,
    // Held while the first response is probed for rate-limit headers.
    probe: tokio::sync::Mutex<()>,
    paused_until: parking_lot::Mutex<Option<Instant>>,
    metrics: MetricsRecorder,
}

impl AsyncApiClient {
    pub fn new(
        client: ApiClient,
        calculator: RateLimitCalculator,
        retry: RetryPolicy,
    ) -> CollectorResult<Self> {
        let throttle = OnceLock::new();
        if let Some(budget) = calculator.configured() {
            let _ = throttle.set(Throttle::new(budget)?);
        }
        Ok(Self {
            client,
            calculator,
            retry,
            throttle,
            probe: tokio::sync::Mutex::new(()),
            paused_until: parking_lot::Mutex::new(None),
            metrics: MetricsRecorder::new(),
        })
    }

    /// Builds the client from a connection's optional `RateLimitPerHour`
    /// plus `API_REQUESTS_PER_HOUR` and `API_RETRY`.
    pub fn from_settings(
        client: ApiClient,
        connection_rate_limit: Option<u64>,
        settings: &Settings,
    ) -> CollectorResult<Self> {
        let global = settings
            .get_parsed::<u64>(settings::API_REQUESTS_PER_HOUR)
            .map_err(|e| CollectorError::InvalidConfig(e.to_string()))?;
        let retry = RetryPolicy::from_settings(settings)
            .map_err(|e| CollectorError::InvalidConfig(e.to_string()))?;
        Self::new(client, RateLimitCalculator::new(connection_rate_limit, global), retry)
    }

    pub fn api_client(&self) -> &ApiClient {
        &self.client
    }

    /// Budget in effect, once known.
    pub fn budget(&self) -> Option<RateBudget> {
        self.throttle.get().map(|t| t.budget)
    }

    /// Requests allowed in flight; the default budget's until the first response.
    pub fn max_workers(&self) -> usize {
        self.budget()
            .unwrap_or_else(|| RateBudget::per_hour(DEFAULT_REQUESTS_PER_HOUR))
            .workers()
    }

    /// Suspends every request of this client for `wait`.
    pub fn pause_for(&self, wait: Duration) {
        let until = Instant::now() + wait;
        let mut paused = self.paused_until.lock();
        if paused.map_or(true, |current| current < until) {
            *paused = Some(until);
        }
    }

    /// GET with throttling and retries.
    pub async fn get(
        &self,
        path: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
        cancel: &CancellationToken,
    ) -> CollectorResult<ApiResponse> {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(CollectorError::Cancelled);
            }
            self.wait_if_paused(cancel).await?;

            let err = match self.send_throttled(path, query, headers, cancel).await {
                Ok(res) => {
                    self.metrics.record_api_request(&res.status.to_string());
                    return Ok(res);
                }
                Err(CollectorError::Cancelled) => return Err(CollectorError::Cancelled),
                Err(e) => e,
            };
            self.metrics.record_api_request(error_label(&err));

            if !err.is_retryable() || !self.retry.should_retry(attempt) {
                return Err(err);
            }
            attempt += 1;

            let wait = match &err {
                CollectorError::RateLimited {
                    retry_after: Some(d),
                } => {
                    self.pause_for(*d);
                    Duration::ZERO
                }
                _ => self.retry.calculate_backoff(attempt),
            };
            warn!(
                path = %path,
                attempt,
                wait_ms = wait.as_millis() as u64,
                error = %err,
                "Retrying API request"
            );
            self.metrics.record_api_retry();
            sleep_or_cancel(wait, cancel).await?;
        }
    }

    /// Waits until no request of this client is in flight.
    pub async fn wait_idle(&self) {
        let _probe = self.probe.lock().await;
        if let Some(throttle) = self.throttle.get() {
            let all = throttle.budget.workers() as u32;
            if let Ok(permits) = throttle.workers.acquire_many(all).await {
                drop(permits);
            }
        }
    }

    async fn wait_if_paused(&self, cancel: &CancellationToken) -> CollectorResult<()> {
        let until = *self.paused_until.lock();
        if let Some(until) = until {
            if until > Instant::now() {
                debug!(wait_ms = (until - Instant::now()).as_millis() as u64, "Client paused by Retry-After");
                tokio::select! {
                    _ = tokio::time::sleep_until(until) => {}
                    _ = cancel.cancelled() => return Err(CollectorError::Cancelled),
                }
            }
        }
        Ok(())
    }

    async fn send_throttled(
        &self,
        path: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
        cancel: &CancellationToken,
    ) -> CollectorResult<ApiResponse> {
        let throttle = match self.throttle.get() {
            Some(throttle) => throttle,
            None => {
                let _guard = tokio::select! {
                    guard = self.probe.lock() => guard,
                    _ = cancel.cancelled() => return Err(CollectorError::Cancelled),
                };
                match self.throttle.get() {
                    Some(throttle) => throttle,
                    None => return self.send_probe(path, query, headers, cancel).await,
                }
            }
        };

        let _permit = tokio::select! {
            permit = throttle.workers.clone().acquire_owned() => {
                permit.map_err(|_| CollectorError::Cancelled)?
            }
            _ = cancel.cancelled() => return Err(CollectorError::Cancelled),
        };
        tokio::select! {
            _ = throttle.limiter.until_ready() => {}
            _ = cancel.cancelled() => return Err(CollectorError::Cancelled),
        }

        let res = self.send_raw(path, query, headers, cancel).await?;
        match error_for_status(&res, Utc::now()) {
            Some(err) => Err(err),
            None => Ok(res),
        }
    }

    async fn send_probe(
        &self,
        path: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
        cancel: &CancellationToken,
    ) -> CollectorResult<ApiResponse> {
        let res = self.send_raw(path, query, headers, cancel).await?;
        let budget = self.calculator.from_probe(&res.headers, Utc::now());
        info!(
            endpoint = %self.client.endpoint(),
            requests = budget.requests,
            window_secs = budget.window.as_secs(),
            workers = budget.workers(),
            "Resolved API rate limit"
        );
        let _ = self.throttle.set(Throttle::new(budget)?);

        match error_for_status(&res, Utc::now()) {
            Some(err) => Err(err),
            None => Ok(res),
        }
    }

    async fn send_raw(
        &self,
        path: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
        cancel: &CancellationToken,
    ) -> CollectorResult<ApiResponse> {
        tokio::select! {
            res = self.client.get(path, query, headers) => res,
            _ = cancel.cancelled() => Err(CollectorError::Cancelled),
        }
    }
}

fn error_label(err: &CollectorError) -> &'static str {
    match err {
        CollectorError::RateLimited { .. } => "rate_limited",
        CollectorError::Forbidden(_) => "403",
        CollectorError::NotFound(_) => "404",
        CollectorError::Unprocessable(_) => "422",
        CollectorError::Upstream { status, .. } if *status >= 500 => "5xx",
        CollectorError::Upstream { .. } => "4xx",
        _ => "transport",
    }
}

async fn sleep_or_cancel(wait: Duration, cancel: &CancellationToken) -> CollectorResult<()> {
    if wait.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = tokio::time::sleep(wait) => Ok(()),
        _ = cancel.cancelled() => Err(CollectorError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn response(status: u16, headers: &[(&'static str, &'static str)]) -> ApiResponse {
        let mut map = HeaderMap::new();
        for (k, v) in headers {
            map.insert(*k, HeaderValue::from_static(v));
        }
        ApiResponse {
            url: "https://api.example.com/repos".into(),
            status,
            headers: map,
            body: b"nope".to_vec(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_status_mapping() {
        assert!(error_for_status(&response(200, &[]), now()).is_none());
        assert!(matches!(
            error_for_status(&response(429, &[("retry-after", "7")]), now()),
            Some(CollectorError::RateLimited { retry_after: Some(d) }) if d == Duration::from_secs(7)
        ));
        assert!(matches!(
            error_for_status(&response(403, &[("x-ratelimit-remaining", "0")]), now()),
            Some(CollectorError::RateLimited { .. })
        ));
        assert!(matches!(
            error_for_status(&response(403, &[]), now()),
            Some(CollectorError::Forbidden(_))
        ));
        assert!(matches!(
            error_for_status(&response(404, &[]), now()),
            Some(CollectorError::NotFound(_))
        ));
        assert!(matches!(
            error_for_status(&response(422, &[]), now()),
            Some(CollectorError::Unprocessable(_))
        ));
        assert!(matches!(
            error_for_status(&response(503, &[]), now()),
            Some(CollectorError::Upstream { status: 503, .. })
        ));
    }

    #[test]
    fn test_resolve_url() {
        let client = ApiClient::new("https://api.example.com/", Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.resolve_url("/repos/a/b", &[("page".into(), "2".into())]),
            "https://api.example.com/repos/a/b?page=2"
        );
        assert_eq!(
            client.resolve_url("search?q=x", &[("label".into(), "a b".into())]),
            "https://api.example.com/search?q=x&label=a%20b"
        );
        assert_eq!(
            client.resolve_url("https://other.example.com/x", &[]),
            "https://other.example.com/x"
        );
    }

    #[test]
    fn test_configured_budget_skips_probe() {
        let client = ApiClient::new("https://api.example.com", Duration::from_secs(5)).unwrap();
        let api = AsyncApiClient::new(
            client,
            RateLimitCalculator::new(Some(3600), None),
            RetryPolicy::immediate(0),
        )
        .unwrap();
        assert_eq!(api.budget(), Some(RateBudget::per_hour(3600)));
        assert_eq!(api.max_workers(), 5);
    }
}
