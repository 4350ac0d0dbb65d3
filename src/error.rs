//! framework error types

use snafu::prelude::*;

use super::gateway::SessionError;
use super::rest::Error as RestError;

/// framework error type
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    /// Call the REST api failed
    #[snafu(display("call rest api failed: {source}"))]
    CallApiFailed {
        /// source error
        source: RestError,
    },

    /// A gateway session failed fatally
    #[snafu(display("gateway session failed: {source}"))]
    GatewayFailed {
        /// source error
        source: SessionError,
    },

    /// Client configuration was rejected before any I/O
    #[snafu(display("invalid configuration: {reason}"))]
    InvalidConfig {
        /// why it was rejected
        reason: String,
    },

    /// The client was already started
    #[snafu(display("client already started"))]
    AlreadyStarted,

    /// A gateway command was rejected because the shard is not ready
    #[snafu(display("shard {shard_id} is not ready"))]
    ShardNotReady {
        /// target shard
        shard_id: u32,
    },

    /// A gateway command could not be delivered because the shard task
    /// has stopped
    #[snafu(display("shard {shard_id} has stopped"))]
    ShardStopped {
        /// target shard
        shard_id: u32,
    },

    /// A gateway command had invalid arguments
    #[snafu(display("invalid argument: {reason}"))]
    InvalidArgument {
        /// why it was rejected
        reason: String,
    },
}
