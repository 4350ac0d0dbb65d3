//! # Fathom
//!
//! An async Discord gateway and REST client.
//!
//! The crate is organized around the two halves of the Discord API:
//!
//! - [`rest`]: the HTTPS surface, with per-route rate limit buckets and
//!   automatic retry of transient failures.
//! - [`gateway`]: the persistent websocket event stream, with the full
//!   session lifecycle (hello, identify/resume, heartbeat, reconnect).
//!
//! [`Client`] ties both together: it bootstraps the gateway connection
//! over REST, spawns one session task per shard, and hands decoded
//! events back through an [`EventStream`] or an [`EventHandler`].

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(missing_debug_implementations, missing_docs)]
#![forbid(unsafe_code)]

pub mod gateway;
pub mod rest;

mod backoff;
mod client;
mod error;

pub use client::{Client, ClientBuilder, EventHandler, EventStream, ShardHandle};
pub use error::Error;

/// framework result type
pub type Result<T> = std::result::Result<T, Error>;
