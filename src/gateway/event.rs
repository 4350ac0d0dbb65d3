//! Dispatched gateway events.

use serde_json::Value;

/// One dispatched event (op 0) received by a shard.
///
/// The body stays raw json; decode it with whatever model types fit the
/// event name.
#[derive(Debug, Clone)]
pub struct Event {
    /// shard that received the event
    pub shard_id: u32,
    /// event name, e.g. `MESSAGE_CREATE`
    pub name: String,
    /// sequence number of the dispatch, when present
    pub seq: Option<u64>,
    /// raw event body
    pub data: Value,
}
