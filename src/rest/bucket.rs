//! Per-route rate limit bookkeeping.
//!
//! Buckets are created lazily on the first request to a route and never
//! deleted; the route set of the API is finite. Identity starts as the
//! normalized route key and is upgraded to the server-assigned bucket id
//! once a response reveals it, so routes that the server groups together
//! end up sharing one bucket. Reset points are computed from the
//! relative `reset-after` header captured at response time, never from
//! server wall-clock timestamps.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::route::Route;

/// requests allowed by the client-side guard per window
const GLOBAL_LIMIT: u32 = 50;
const GLOBAL_WINDOW: Duration = Duration::from_secs(1);

/// invalid responses tolerated per window before sends are paused
const INVALID_LIMIT: u32 = 10_000;
const INVALID_WINDOW: Duration = Duration::from_secs(600);

/// Rate limit state parsed from one response's headers.
#[derive(Debug, Clone, Default)]
pub struct RateLimitHeaders {
    /// `x-ratelimit-limit`
    pub limit: Option<u32>,
    /// `x-ratelimit-remaining`
    pub remaining: Option<u32>,
    /// `x-ratelimit-reset-after` in seconds, relative
    pub reset_after: Option<f64>,
    /// `retry-after` in seconds, relative
    pub retry_after: Option<f64>,
    /// `x-ratelimit-bucket`, the server-assigned bucket id
    pub bucket: Option<String>,
    /// `x-ratelimit-global`
    pub global: bool,
    /// `x-ratelimit-scope`
    pub scope: Option<String>,
}

impl RateLimitHeaders {
    /// Pick the rate limit headers out of a response header map.
    pub fn parse(headers: &HeaderMap) -> Self {
        let text = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
        };

        Self {
            limit: text("x-ratelimit-limit").and_then(|v| v.parse().ok()),
            remaining: text("x-ratelimit-remaining").and_then(|v| v.parse().ok()),
            reset_after: text("x-ratelimit-reset-after").and_then(|v| v.parse().ok()),
            retry_after: text("retry-after").and_then(|v| v.parse().ok()),
            bucket: text("x-ratelimit-bucket").map(str::to_string),
            global: text("x-ratelimit-global")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            scope: text("x-ratelimit-scope").map(str::to_string),
        }
    }
}

/// One bucket's accounting.
#[derive(Debug, Default)]
pub(crate) struct BucketState {
    remaining: Option<u32>,
    reset_at: Option<Instant>,
}

impl BucketState {
    /// Fold one response's headers in. Called unconditionally, error
    /// responses included, since the headers reflect true server state.
    pub fn update(&mut self, headers: &RateLimitHeaders, now: Instant) {
        if let Some(remaining) = headers.remaining {
            self.remaining = Some(remaining);
        }
        if let Some(reset_after) = headers.reset_after {
            self.reset_at = Some(now + Duration::from_secs_f64(reset_after));
        }
    }

    /// When the next send must wait until, `None` when clear.
    pub fn delay_until(&self, now: Instant) -> Option<Instant> {
        match (self.remaining, self.reset_at) {
            (Some(0), Some(reset_at)) if now < reset_at => Some(reset_at),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct Maps {
    by_key: HashMap<(String, String), Arc<Mutex<BucketState>>>,
    route_to_bucket: HashMap<String, String>,
}

#[derive(Debug)]
struct GlobalState {
    block_until: Option<Instant>,
    window_start: Instant,
    window_count: u32,
    invalid_window_start: Instant,
    invalid_count: u32,
    invalid_block_until: Option<Instant>,
}

/// Shared bucket table plus the process-wide global limit.
#[derive(Debug)]
pub(crate) struct RateLimitTable {
    maps: std::sync::Mutex<Maps>,
    global: std::sync::Mutex<GlobalState>,
}

impl RateLimitTable {
    pub fn new() -> Self {
        let now = Instant::now();

        Self {
            maps: std::sync::Mutex::new(Maps::default()),
            global: std::sync::Mutex::new(GlobalState {
                block_until: None,
                window_start: now,
                window_count: 0,
                invalid_window_start: now,
                invalid_count: 0,
                invalid_block_until: None,
            }),
        }
    }

    /// The bucket a route maps to right now.
    ///
    /// Requests lock the returned bucket for their whole send, which
    /// serves one bucket in submission order while leaving other
    /// buckets untouched.
    pub fn bucket(&self, route: &Route) -> Arc<Mutex<BucketState>> {
        let mut maps = self.maps.lock().expect("bucket table lock poisoned");

        let id = maps
            .route_to_bucket
            .get(route.key())
            .cloned()
            .unwrap_or_else(|| route.key().to_string());

        maps.by_key
            .entry((id, route.major().to_string()))
            .or_default()
            .clone()
    }

    /// Remember the server-assigned bucket id for a route.
    pub fn record_bucket_id(&self, route: &Route, bucket_id: &str) {
        if bucket_id.is_empty() {
            return;
        }

        let mut maps = self.maps.lock().expect("bucket table lock poisoned");
        maps.route_to_bucket
            .insert(route.key().to_string(), bucket_id.to_string());
    }

    /// When the next send must wait until for global reasons, `None`
    /// when clear. Interaction routes are exempt from the client-side
    /// guard but still honor a server-imposed global block.
    pub fn global_delay(&self, now: Instant, exempt: bool) -> Option<Instant> {
        let mut global = self.global.lock().expect("global state lock poisoned");

        if let Some(until) = global.block_until {
            if now < until {
                return Some(until);
            }
            global.block_until = None;
        }

        if exempt {
            return None;
        }

        if now.duration_since(global.window_start) >= GLOBAL_WINDOW {
            global.window_start = now;
            global.window_count = 0;
        }
        if global.window_count >= GLOBAL_LIMIT {
            return Some(global.window_start + GLOBAL_WINDOW);
        }

        None
    }

    /// Count one send against the client-side guard.
    pub fn commit_send(&self, now: Instant, exempt: bool) {
        if exempt {
            return;
        }

        let mut global = self.global.lock().expect("global state lock poisoned");
        if now.duration_since(global.window_start) >= GLOBAL_WINDOW {
            global.window_start = now;
            global.window_count = 0;
        }
        global.window_count += 1;
    }

    /// Block every bucket until the server-supplied instant.
    pub fn note_global_block(&self, until: Instant) {
        let mut global = self.global.lock().expect("global state lock poisoned");
        global.block_until = Some(until);
    }

    /// Count one 401/403/429 against the invalid request window.
    pub fn note_invalid(&self, now: Instant) {
        let mut global = self.global.lock().expect("global state lock poisoned");

        if now.duration_since(global.invalid_window_start) >= INVALID_WINDOW {
            global.invalid_window_start = now;
            global.invalid_count = 0;
        }

        global.invalid_count += 1;
        if global.invalid_count >= INVALID_LIMIT {
            global.invalid_block_until = Some(global.invalid_window_start + INVALID_WINDOW);
        }
    }

    /// Time left on the invalid request pause, `None` when sending is
    /// allowed.
    pub fn invalid_blocked(&self, now: Instant) -> Option<Duration> {
        let mut global = self.global.lock().expect("global state lock poisoned");

        match global.invalid_block_until {
            Some(until) if now < until => Some(until - now),
            Some(_) => {
                global.invalid_block_until = None;
                None
            }
            None => None,
        }
    }
}

#[cfg(test)]
mod test {
    use reqwest::header::HeaderValue;
    use reqwest::Method;

    use super::*;

    fn headers(entries: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in entries {
            map.insert(
                reqwest::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_parse_rate_limit_headers() {
        let parsed = RateLimitHeaders::parse(&headers(&[
            ("x-ratelimit-limit", "5"),
            ("x-ratelimit-remaining", "0"),
            ("x-ratelimit-reset-after", "2.5"),
            ("x-ratelimit-bucket", "abcd1234"),
            ("x-ratelimit-global", "true"),
        ]));

        assert_eq!(parsed.limit, Some(5));
        assert_eq!(parsed.remaining, Some(0));
        assert_eq!(parsed.reset_after, Some(2.5));
        assert_eq!(parsed.bucket.as_deref(), Some("abcd1234"));
        assert!(parsed.global);
        assert!(parsed.retry_after.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_bucket_delays_until_reset() {
        let mut state = BucketState::default();
        let now = Instant::now();

        state.update(
            &RateLimitHeaders {
                remaining: Some(0),
                reset_after: Some(2.0),
                ..RateLimitHeaders::default()
            },
            now,
        );

        assert_eq!(state.delay_until(now), Some(now + Duration::from_secs(2)));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(state.delay_until(Instant::now()), None);
    }

    #[test]
    fn test_bucket_with_quota_is_eligible() {
        let mut state = BucketState::default();
        let now = Instant::now();

        state.update(
            &RateLimitHeaders {
                remaining: Some(3),
                reset_after: Some(60.0),
                ..RateLimitHeaders::default()
            },
            now,
        );

        assert_eq!(state.delay_until(now), None);
    }

    #[test]
    fn test_bucket_id_remapping_merges_routes() {
        let table = RateLimitTable::new();
        let first = Route::new(&Method::GET, "/channels/1/messages");
        let second = Route::new(&Method::POST, "/channels/1/messages");

        assert!(!Arc::ptr_eq(
            &table.bucket(&first),
            &table.bucket(&second)
        ));

        table.record_bucket_id(&first, "shared");
        table.record_bucket_id(&second, "shared");

        assert!(Arc::ptr_eq(&table.bucket(&first), &table.bucket(&second)));
    }

    #[test]
    fn test_major_parameter_keeps_buckets_apart() {
        let table = RateLimitTable::new();
        let first = Route::new(&Method::GET, "/channels/1/messages");
        let second = Route::new(&Method::GET, "/channels/2/messages");

        table.record_bucket_id(&first, "shared");
        table.record_bucket_id(&second, "shared");

        assert!(!Arc::ptr_eq(
            &table.bucket(&first),
            &table.bucket(&second)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_side_global_guard() {
        let table = RateLimitTable::new();
        let now = Instant::now();

        for _ in 0..GLOBAL_LIMIT {
            assert!(table.global_delay(now, false).is_none());
            table.commit_send(now, false);
        }

        assert!(table.global_delay(now, false).is_some());
        // exempt routes skip the guard
        assert!(table.global_delay(now, true).is_none());

        tokio::time::advance(GLOBAL_WINDOW).await;
        assert!(table.global_delay(Instant::now(), false).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_global_block_applies_to_exempt_routes_too() {
        let table = RateLimitTable::new();
        let now = Instant::now();

        table.note_global_block(now + Duration::from_secs(3));

        assert_eq!(
            table.global_delay(now, true),
            Some(now + Duration::from_secs(3))
        );

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(table.global_delay(Instant::now(), true).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_request_window_pauses_sending() {
        let table = RateLimitTable::new();
        let now = Instant::now();

        for _ in 0..INVALID_LIMIT {
            table.note_invalid(now);
        }

        assert!(table.invalid_blocked(now).is_some());

        tokio::time::advance(INVALID_WINDOW).await;
        assert!(table.invalid_blocked(Instant::now()).is_none());
    }
}
