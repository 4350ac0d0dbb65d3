//! REST error types.

use std::time::Duration;

use snafu::prelude::*;

use super::types::ApiErrorBody;

/// Error from the underlying HTTP transport, meaning no HTTP response
/// was received at all.
#[derive(Debug, Clone, Snafu)]
#[snafu(display("{message}"))]
pub struct TransportError {
    /// description of the failure
    pub message: String,
}

impl TransportError {
    /// Wrap any transport failure.
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// REST API Error
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(variant), context(suffix(false)))]
pub enum Error {
    /// bot token is invalid (contains characters that cannot be sent in
    /// an HTTP header)
    #[snafu(display("bot token {token} is invalid"))]
    TokenInvalid {
        /// input token
        token: String,
    },

    /// create HTTP client failed
    #[snafu(display("create rest client failed: {source}"))]
    ClientCreateFailed {
        /// source error
        source: reqwest::Error,
    },

    /// the request was rejected before any I/O
    #[snafu(display("invalid request: {reason}"))]
    InvalidRequest {
        /// why it was rejected
        reason: String,
    },

    /// no HTTP response after exhausting the retry budget
    #[snafu(display("{} {url} failed after {attempts} attempts: {source}", method.as_str()))]
    RequestFailed {
        /// http method
        method: reqwest::Method,
        /// target url
        url: String,
        /// attempts made
        attempts: u32,
        /// last transport failure
        source: TransportError,
    },

    /// the server rejected our credentials (401/403), never retried
    #[snafu(display("{} {url} denied with status {status}: {}", method.as_str(), body.message))]
    AuthFailed {
        /// http method
        method: reqwest::Method,
        /// target url
        url: String,
        /// received status
        status: reqwest::StatusCode,
        /// parsed error body
        body: Box<ApiErrorBody>,
    },

    /// a non-retryable client error (404, 405, 409, other 4xx)
    #[snafu(display(
        "{} {url} failed with status {status}, api code {}: {}",
        method.as_str(),
        body.code,
        body.message
    ))]
    ApiError {
        /// http method
        method: reqwest::Method,
        /// target url
        url: String,
        /// received status
        status: reqwest::StatusCode,
        /// parsed error body
        body: Box<ApiErrorBody>,
    },

    /// 5xx responses on every attempt
    #[snafu(display("{} {url} failed with status {status} after {attempts} attempts", method.as_str()))]
    ServerError {
        /// http method
        method: reqwest::Method,
        /// target url
        url: String,
        /// last received status
        status: reqwest::StatusCode,
        /// attempts made
        attempts: u32,
    },

    /// still rate limited after exhausting the retry budget
    #[snafu(display("{} {url} rate limited, retry after {retry_after:?}", method.as_str()))]
    RateLimited {
        /// http method
        method: reqwest::Method,
        /// target url
        url: String,
        /// wait the server asked for
        retry_after: Duration,
    },

    /// too many invalid requests recently; sending is paused to avoid a
    /// network-level ban
    #[snafu(display("invalid request limit hit, paused for {retry_in:?}"))]
    InvalidRequestsBlocked {
        /// time until the window clears
        retry_in: Duration,
    },

    /// parse response body as the target json type failed
    #[snafu(display("parse response body failed: {source}"))]
    ParseBodyFailed {
        /// http response body
        body: bytes::Bytes,
        /// source parse error
        source: serde_json::Error,
    },
}
