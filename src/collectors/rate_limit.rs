//! Request budget calculation and `Retry-After` handling.
//!
//! A budget of `requests` per `window` is turned into a worker count and a
//! token refill interval:
//!
//! ```text
//!   workers  = ceil(requests / (window / 5s))
//!   interval = window / requests
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;

/// Requests per hour assumed when neither configuration nor the server says otherwise.
pub const DEFAULT_REQUESTS_PER_HOUR: u64 = 18_000;

const WORKER_SLOT: Duration = Duration::from_secs(5);
const HOUR: Duration = Duration::from_secs(3600);

/// Number of requests allowed over a time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBudget {
    pub requests: u64,
    pub window: Duration,
}

impl RateBudget {
    pub fn per_hour(requests: u64) -> Self {
        Self {
            requests: requests.max(1),
            window: HOUR,
        }
    }

    /// Concurrent requests allowed in flight.
    pub fn workers(&self) -> usize {
        let slots = (self.window.as_secs_f64() / WORKER_SLOT.as_secs_f64()).max(1.0);
        ((self.requests as f64 / slots).ceil() as usize).max(1)
    }

    /// Time between two request tokens.
    pub fn tick_interval(&self) -> Duration {
        let interval = self.window / self.requests.max(1) as u32;
        interval.max(Duration::from_millis(1))
    }
}

/// Chooses the budget for one connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimitCalculator {
    /// Connection's `RateLimitPerHour`, if set.
    pub connection_per_hour: Option<u64>,
    /// Process-wide `API_REQUESTS_PER_HOUR`, if set.
    pub global_per_hour: Option<u64>,
}

impl RateLimitCalculator {
    pub fn new(connection_per_hour: Option<u64>, global_per_hour: Option<u64>) -> Self {
        Self {
            connection_per_hour: connection_per_hour.filter(|r| *r > 0),
            global_per_hour: global_per_hour.filter(|r| *r > 0),
        }
    }

    /// Budget known without talking to the server.
    pub fn configured(&self) -> Option<RateBudget> {
        self.connection_per_hour
            .or(self.global_per_hour)
            .map(RateBudget::per_hour)
    }

    /// Budget derived from the first response when nothing is configured.
    pub fn from_probe(&self, headers: &HeaderMap, now: DateTime<Utc>) -> RateBudget {
        self.configured()
            .or_else(|| budget_from_headers(headers, now))
            .unwrap_or_else(|| RateBudget::per_hour(DEFAULT_REQUESTS_PER_HOUR))
    }
}

fn header_u64(headers: &HeaderMap, names: &[&str]) -> Option<u64> {
    names.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    })
}

/// Reads `X-RateLimit-*` style headers.
///
/// The reset header may hold epoch seconds or seconds from now.
pub fn budget_from_headers(headers: &HeaderMap, now: DateTime<Utc>) -> Option<RateBudget> {
    let limit = header_u64(headers, &["x-ratelimit-limit", "ratelimit-limit"]);
    let remaining = header_u64(headers, &["x-ratelimit-remaining", "ratelimit-remaining"]);
    let requests = remaining.or(limit)?.max(1);

    let window = match header_u64(headers, &["x-ratelimit-reset", "ratelimit-reset"]) {
        Some(reset) if reset > 1_000_000_000 => {
            let delta = reset as i64 - now.timestamp();
            Duration::from_secs(delta.max(1) as u64)
        }
        Some(delta) => Duration::from_secs(delta.max(1)),
        None => HOUR,
    };

    Some(RateBudget { requests, window })
}

/// Parses a `Retry-After` value given as seconds or as an HTTP date.
///
/// Dates in the past yield a zero wait; unparseable values yield `None`.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use reqwest::header::HeaderValue;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_retry_after_seconds() {
        assert_eq!(parse_retry_after("10", now()), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_retry_after_http_date() {
        let at = now() + chrono::Duration::seconds(5);
        let imf = at.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let wait = parse_retry_after(&imf, now()).unwrap();
        assert!(wait >= Duration::from_secs(4) && wait <= Duration::from_secs(6));

        let past = (now() - chrono::Duration::seconds(30)).to_rfc2822();
        assert_eq!(parse_retry_after(&past, now()), Some(Duration::ZERO));
        assert_eq!(parse_retry_after("soon", now()), None);
    }

    #[test]
    fn test_default_budget_math() {
        let budget = RateBudget::per_hour(DEFAULT_REQUESTS_PER_HOUR);
        assert_eq!(budget.workers(), 25);
        assert_eq!(budget.tick_interval(), Duration::from_millis(200));
        assert_eq!(RateBudget::per_hour(1).workers(), 1);
    }

    #[test]
    fn test_budget_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-limit", HeaderValue::from_static("5000"));
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("1200"));
        let reset = (now().timestamp() + 600).to_string();
        headers.insert("x-ratelimit-reset", HeaderValue::from_str(&reset).unwrap());

        let budget = budget_from_headers(&headers, now()).unwrap();
        assert_eq!(budget.requests, 1200);
        assert_eq!(budget.window, Duration::from_secs(600));
        assert_eq!(budget.workers(), 10);
        assert!(budget_from_headers(&HeaderMap::new(), now()).is_none());
    }

    #[test]
    fn test_configured_budget_wins_over_probe() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("10"));

        let calc = RateLimitCalculator::new(Some(3600), Some(7200));
        assert_eq!(calc.from_probe(&headers, now()), RateBudget::per_hour(3600));

        let calc = RateLimitCalculator::new(None, None);
        assert_eq!(calc.configured(), None);
        assert_eq!(calc.from_probe(&headers, now()).requests, 10);
        assert_eq!(
            calc.from_probe(&HeaderMap::new(), now()),
            RateBudget::per_hour(DEFAULT_REQUESTS_PER_HOUR)
        );
    }
}
