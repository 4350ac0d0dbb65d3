//! Discord REST api client.
//!
//! [`Client`] owns the rate limit bookkeeping for every request it
//! sends: requests to the same normalized [`Route`] share a bucket and
//! are served in submission order, buckets wait out their own reset
//! windows, and a global 429 pauses everything until it clears.
//! Transient failures (transport errors, 5xx, 429) retry with backoff
//! up to a bounded attempt budget; everything else returns as a typed
//! outcome.

mod bucket;
mod client;
mod error;
mod route;
pub mod types;

pub use bucket::RateLimitHeaders;
pub use client::{
    AuthKind, Client, Request, Response, Transport, TransportRequest, TransportResponse,
};
pub use error::{Error, TransportError};
pub use route::Route;

/// Result type for rest module
pub type Result<T> = std::result::Result<T, Error>;
