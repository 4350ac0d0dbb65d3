//! Gateway error types.

use snafu::prelude::*;

use super::close::CloseCode;
use super::pacer::AcquireError;

/// Terminal failure of a gateway session.
///
/// Sessions absorb transient problems (dropped sockets, resumable close
/// codes, transient protocol errors) by reconnecting on their own; only
/// failures that make reconnecting pointless surface through the event
/// stream as one of these.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(variant), context(suffix(false)))]
pub enum SessionError {
    /// the gateway closed the connection with a code that forbids
    /// reconnecting
    #[snafu(display(
        "gateway closed the connection: {} ({})",
        code.code(),
        code.description()
    ))]
    FatalClose {
        /// the close code received
        code: CloseCode,
    },

    /// the identify budget ran out
    #[snafu(display("identify rejected: {source}"))]
    IdentifyBudget {
        /// source error
        source: AcquireError,
    },

    /// the gateway url cannot be used
    #[snafu(display("invalid gateway url {url}: {reason}"))]
    InvalidGatewayUrl {
        /// the offending url
        url: String,
        /// why it was rejected
        reason: String,
    },
}
