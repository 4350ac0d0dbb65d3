//! REST dispatcher.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use snafu::prelude::*;
use tokio::time::Instant;

use super::bucket::{RateLimitHeaders, RateLimitTable};
use super::error::{variant, TransportError};
use super::route::Route;
use super::types::{ApiErrorBody, Gateway, GatewayBot, RateLimitBody};
use super::{Error, Result};
use crate::backoff::Backoff;

static BASE_URL: &str = "https://discord.com/api/v10";

// the platform mandates the `DiscordBot (url, version)` shape
static APP_USER_AGENT: &str = concat!(
    "DiscordBot (",
    env!("CARGO_PKG_REPOSITORY"),
    ", ",
    env!("CARGO_PKG_VERSION"),
    ") ",
    env!("CARGO_PKG_NAME"),
);

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// How the Authorization header is formatted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    /// `Bot <token>`
    Bot,
    /// `Bearer <token>`
    Bearer,
}

impl AuthKind {
    fn scheme(self) -> &'static str {
        match self {
            Self::Bot => "Bot",
            Self::Bearer => "Bearer",
        }
    }
}

/// A request handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    body: Option<Bytes>,
    content_type: Option<&'static str>,
    headers: Vec<(String, String)>,
    auth: bool,
    max_attempts: Option<u32>,
}

impl Request {
    /// A bare request for an api path such as `/users/@me`.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            content_type: None,
            headers: Vec::new(),
            auth: true,
            max_attempts: None,
        }
    }

    /// Attach a json body.
    pub fn json<T: serde::Serialize>(mut self, body: &T) -> Result<Self> {
        let body = serde_json::to_vec(body).map_err(|err| Error::InvalidRequest {
            reason: format!("unserializable body: {err}"),
        })?;
        self.body = Some(body.into());
        self.content_type = Some("application/json");
        Ok(self)
    }

    /// Attach a raw body with an explicit content type.
    pub fn raw_body(mut self, body: Bytes, content_type: &'static str) -> Self {
        self.body = Some(body);
        self.content_type = Some(content_type);
        self
    }

    /// Add an extra header. `Authorization` and `User-Agent` belong to
    /// the dispatcher and are rejected here.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let value = value.into();

        if name.eq_ignore_ascii_case("authorization") || name.eq_ignore_ascii_case("user-agent")
        {
            return variant::InvalidRequest {
                reason: format!("header {name} is managed by the client"),
            }
            .fail();
        }
        if name.eq_ignore_ascii_case("content-type") && self.content_type.is_some() {
            return variant::InvalidRequest {
                reason: "content type is already set by the body",
            }
            .fail();
        }

        self.headers.push((name, value));
        Ok(self)
    }

    /// Skip the Authorization header for this request.
    pub fn no_auth(mut self) -> Self {
        self.auth = false;
        self
    }

    /// Override the per-request retry budget.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }
}

/// Fully built request passed to a [`Transport`].
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// http method
    pub method: Method,
    /// absolute url
    pub url: String,
    /// complete header set
    pub headers: HeaderMap,
    /// request body, when any
    pub body: Option<Bytes>,
    /// request timeout
    pub timeout: Duration,
}

/// Raw response a [`Transport`] hands back.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// http status
    pub status: StatusCode,
    /// response headers
    pub headers: HeaderMap,
    /// response body
    pub body: Bytes,
}

/// Executes one HTTP exchange.
///
/// The default implementation is reqwest; supply your own to run the
/// dispatcher against a scripted server in tests or through a proxy.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform the request, returning whatever HTTP response arrived.
    async fn execute(
        &self,
        request: TransportRequest,
    ) -> std::result::Result<TransportResponse, TransportError>;
}

#[derive(Debug)]
struct HttpTransport {
    client: reqwest::Client,
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(
        &self,
        request: TransportRequest,
    ) -> std::result::Result<TransportResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers)
            .timeout(request.timeout);

        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(TransportError::from)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(TransportError::from)?;

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

/// A successful (2xx) REST response.
#[derive(Debug, Clone)]
pub struct Response {
    /// http status
    pub status: StatusCode,
    /// rate limit state echoed by the server
    pub rate_limit: RateLimitHeaders,
    /// response body
    pub body: Bytes,
}

impl Response {
    /// Decode the body as json.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).context(variant::ParseBodyFailed {
            body: self.body.clone(),
        })
    }
}

struct ClientInner {
    transport: Box<dyn Transport>,
    auth_header: HeaderValue,
    table: RateLimitTable,
    timeout: Duration,
    max_attempts: u32,
}

/// Discord REST api client.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("timeout", &self.inner.timeout)
            .field("max_attempts", &self.inner.max_attempts)
            .finish()
    }
}

impl Client {
    fn new(kind: AuthKind, token: &str, transport: Option<Box<dyn Transport>>) -> Result<Self> {
        let auth_header = format!("{} {}", kind.scheme(), token)
            .parse::<HeaderValue>()
            .map_err(|_| {
                variant::TokenInvalid {
                    token: token.to_string(),
                }
                .build()
            })?;

        let transport: Box<dyn Transport> = match transport {
            Some(transport) => transport,
            None => {
                let client = reqwest::Client::builder()
                    .gzip(true)
                    .deflate(true)
                    .user_agent(APP_USER_AGENT)
                    .build()
                    .context(variant::ClientCreateFailed)?;
                Box::new(HttpTransport { client })
            }
        };

        Ok(Self {
            inner: Arc::new(ClientInner {
                transport,
                auth_header,
                table: RateLimitTable::new(),
                timeout: DEFAULT_TIMEOUT,
                max_attempts: DEFAULT_MAX_ATTEMPTS,
            }),
        })
    }

    /// Create a client using a bot token.
    pub fn new_from_bot_token<S: AsRef<str> + ?Sized>(token: &S) -> Result<Self> {
        Self::new(AuthKind::Bot, token.as_ref(), None)
    }

    /// Create a client using an oauth2 bearer token.
    pub fn new_from_bearer_token<S: AsRef<str> + ?Sized>(token: &S) -> Result<Self> {
        Self::new(AuthKind::Bearer, token.as_ref(), None)
    }

    /// Create a client with a custom [`Transport`].
    pub fn with_transport<S: AsRef<str> + ?Sized>(
        kind: AuthKind,
        token: &S,
        transport: Box<dyn Transport>,
    ) -> Result<Self> {
        Self::new(kind, token.as_ref(), Some(transport))
    }

    /// Call `GET /gateway/bot`: the gateway url plus the session start
    /// budget for the [`IdentifyPacer`](crate::gateway::IdentifyPacer).
    pub async fn gateway_bot(&self) -> Result<GatewayBot> {
        self.request_json(Request::new(Method::GET, "/gateway/bot"))
            .await
    }

    /// Call `GET /gateway`, the unauthenticated gateway url.
    pub async fn gateway(&self) -> Result<Gateway> {
        self.request_json(Request::new(Method::GET, "/gateway").no_auth())
            .await
    }

    /// Execute a request and decode the 2xx body as json.
    pub async fn request_json<T: serde::de::DeserializeOwned>(
        &self,
        request: Request,
    ) -> Result<T> {
        self.execute(request).await?.json()
    }

    /// Execute a request through the rate limit machinery.
    pub async fn execute(&self, request: Request) -> Result<Response> {
        ensure!(
            request.path.starts_with('/'),
            variant::InvalidRequest {
                reason: format!("path {} must start with /", request.path),
            }
        );

        let url = format!("{BASE_URL}{}", request.path);
        let route = Route::new(&request.method, &request.path);
        // interaction callbacks carry their own token in the path and are
        // exempt from auth and the client-side global guard
        let exempt = route.is_interaction();
        let headers = self.build_headers(&request, exempt)?;
        let max_attempts = request.max_attempts.unwrap_or(self.inner.max_attempts).max(1);
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(15));
        let mut attempt = 0;

        loop {
            attempt += 1;

            if let Some(retry_in) = self.inner.table.invalid_blocked(Instant::now()) {
                return variant::InvalidRequestsBlocked { retry_in }.fail();
            }

            let bucket = self.inner.table.bucket(&route);
            let mut state = bucket.lock().await;

            // wait out the global limit, then this bucket's own window;
            // holding the bucket lock keeps same-bucket requests FIFO
            // while other buckets proceed
            loop {
                let now = Instant::now();
                let wait = self
                    .inner
                    .table
                    .global_delay(now, exempt)
                    .or_else(|| state.delay_until(now));

                match wait {
                    Some(until) => {
                        log::debug!(
                            "{} {} waiting {:?} for rate limit",
                            request.method.as_str(),
                            route.key(),
                            until - now
                        );
                        tokio::time::sleep_until(until).await;
                    }
                    None => break,
                }
            }

            let transport_request = TransportRequest {
                method: request.method.clone(),
                url: url.clone(),
                headers: headers.clone(),
                body: request.body.clone(),
                timeout: self.inner.timeout,
            };

            log::trace!(
                "{} {} attempt {}/{}",
                request.method.as_str(),
                url,
                attempt,
                max_attempts
            );

            let sent = self.inner.transport.execute(transport_request).await;
            self.inner.table.commit_send(Instant::now(), exempt);

            let response = match sent {
                Ok(response) => response,
                Err(source) => {
                    drop(state);
                    log::warn!(
                        "{} {} transport failure: {}",
                        request.method.as_str(),
                        url,
                        source
                    );

                    if attempt >= max_attempts {
                        return Err(Error::RequestFailed {
                            method: request.method.clone(),
                            url,
                            attempts: attempt,
                            source,
                        });
                    }

                    tokio::time::sleep(backoff.next_delay()).await;
                    continue;
                }
            };

            // bucket headers reflect true server-side state, error
            // responses included
            let now = Instant::now();
            let rate_limit = RateLimitHeaders::parse(&response.headers);
            state.update(&rate_limit, now);
            if let Some(ref bucket_id) = rate_limit.bucket {
                self.inner.table.record_bucket_id(&route, bucket_id);
            }
            drop(state);

            let status = response.status;

            if status.is_success() {
                return Ok(Response {
                    status,
                    rate_limit,
                    body: response.body,
                });
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                let body: RateLimitBody =
                    serde_json::from_slice(&response.body).unwrap_or_default();
                let retry_after = rate_limit
                    .retry_after
                    .or((body.retry_after > 0.0).then_some(body.retry_after))
                    .unwrap_or(1.0);
                let retry_after = Duration::from_secs_f64(retry_after);

                self.inner.table.note_invalid(now);
                if rate_limit.global || body.global {
                    log::warn!("Global rate limit hit, pausing {:?}", retry_after);
                    self.inner.table.note_global_block(now + retry_after);
                }

                if attempt < max_attempts {
                    log::debug!(
                        "{} {} rate limited, retrying after {:?}",
                        request.method.as_str(),
                        url,
                        retry_after
                    );
                    tokio::time::sleep(retry_after).await;
                    continue;
                }

                return variant::RateLimited {
                    method: request.method.clone(),
                    url,
                    retry_after,
                }
                .fail();
            }

            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                self.inner.table.note_invalid(now);
                return variant::AuthFailed {
                    method: request.method.clone(),
                    url,
                    status,
                    body: Box::new(parse_error_body(&response.body)),
                }
                .fail();
            }

            if status.is_server_error() {
                if attempt < max_attempts {
                    log::warn!(
                        "{} {} got status {}, retrying",
                        request.method.as_str(),
                        url,
                        status
                    );
                    tokio::time::sleep(backoff.next_delay()).await;
                    continue;
                }

                return variant::Server {
                    method: request.method.clone(),
                    url,
                    status,
                    attempts: attempt,
                }
                .fail();
            }

            // remaining 4xx (404, 405, 409, ...) are returned as-is
            return variant::Api {
                method: request.method.clone(),
                url,
                status,
                body: Box::new(parse_error_body(&response.body)),
            }
            .fail();
        }
    }

    fn build_headers(&self, request: &Request, exempt: bool) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        if request.auth && !exempt {
            headers.insert(AUTHORIZATION, self.inner.auth_header.clone());
        }
        if let Some(content_type) = request.content_type {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        }

        for (name, value) in &request.headers {
            let name = name.parse::<HeaderName>().map_err(|_| {
                variant::InvalidRequest {
                    reason: format!("invalid header name {name}"),
                }
                .build()
            })?;
            let value = value.parse::<HeaderValue>().map_err(|_| {
                variant::InvalidRequest {
                    reason: format!("invalid value for header {name}"),
                }
                .build()
            })?;
            headers.insert(name, value);
        }

        Ok(headers)
    }
}

fn parse_error_body(body: &Bytes) -> ApiErrorBody {
    serde_json::from_slice(body).unwrap_or_else(|_| ApiErrorBody {
        code: 0,
        message: String::from_utf8_lossy(body).into_owned(),
        errors: None,
    })
}
