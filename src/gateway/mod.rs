//! Discord gateway (websocket) protocol client.
//!
//! A [`session`](SessionState) is one shard's connection lifecycle:
//! connect, wait for the server hello, identify (paced by the shared
//! [`IdentifyPacer`]) or resume, then stream dispatches while
//! heartbeating. Close codes decide whether a dropped connection is
//! resumed, re-identified, or fatal; see [`ClosePolicy`].

mod close;
mod compression;
mod error;
mod event;
mod intents;
mod pacer;
mod payload;
pub(crate) mod session;

pub use close::{CloseAction, CloseCode, ClosePolicy};
pub use compression::DecompressError;
pub use error::SessionError;
pub use event::Event;
pub use intents::Intents;
pub use pacer::{AcquireError, IdentifyPacer, SessionStartLimit};
pub use payload::{Envelope, Hello, Opcode, ParsePayloadError, Payload, Ready};
pub use session::SessionState;
