//! Gateway frame envelope and payload construction.
//!
//! Only the envelope (`op`, `d`, `s`, `t`) and the handful of fields the
//! session state machine inspects are typed here; dispatched event
//! bodies stay raw [`serde_json::Value`] for the caller to decode.

use enum_as_inner::EnumAsInner;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use snafu::prelude::*;

use super::intents::Intents;

/// Error when parsing bytes as a gateway payload
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(error), context(suffix(false)))]
pub enum ParsePayloadError {
    /// data is not a valid json envelope
    #[snafu(display("parse envelope failed: {source}"))]
    ParseEnvelopeFailed {
        /// source error
        source: serde_json::Error,
    },

    /// the typed view of the `d` field failed to parse
    #[snafu(display("parse op {op} data failed: {source}"))]
    ParseDataFailed {
        /// opcode whose data was malformed
        op: u8,
        /// source error
        source: serde_json::Error,
    },
}

/// Gateway opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// an event was dispatched
    Dispatch,
    /// keepalive, sent by both sides
    Heartbeat,
    /// starts a new session
    Identify,
    /// updates the bot presence
    PresenceUpdate,
    /// joins/moves/leaves voice channels
    VoiceStateUpdate,
    /// reattaches to an existing session
    Resume,
    /// the server asks the client to reconnect and resume
    Reconnect,
    /// requests guild member chunks
    RequestGuildMembers,
    /// the session is invalid, identify or resume again
    InvalidSession,
    /// first message of a connection, carries the heartbeat interval
    Hello,
    /// acknowledges a client heartbeat
    HeartbeatAck,
    /// requests soundboard sounds for guilds
    RequestSoundboardSounds,
}

impl Opcode {
    /// Map a wire value to an opcode.
    pub fn from_u8(op: u8) -> Option<Self> {
        Some(match op {
            0 => Self::Dispatch,
            1 => Self::Heartbeat,
            2 => Self::Identify,
            3 => Self::PresenceUpdate,
            4 => Self::VoiceStateUpdate,
            6 => Self::Resume,
            7 => Self::Reconnect,
            8 => Self::RequestGuildMembers,
            9 => Self::InvalidSession,
            10 => Self::Hello,
            11 => Self::HeartbeatAck,
            31 => Self::RequestSoundboardSounds,
            _ => return None,
        })
    }
}

/// The raw frame envelope: `op`, `d`, `s`, `t`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// opcode
    pub op: u8,
    /// payload data
    #[serde(default)]
    pub d: Value,
    /// sequence number, only on dispatches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    /// event name, only on dispatches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

/// Hello data: heartbeat cadence for this connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    /// milliseconds between heartbeats
    pub heartbeat_interval: u64,
}

/// Fields of the `READY` dispatch the session itself tracks.
#[derive(Debug, Clone, Deserialize)]
pub struct Ready {
    /// session id used for later resumes
    pub session_id: String,
    /// dedicated endpoint for resume attempts
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
}

/// A decoded inbound frame, classified by opcode.
#[derive(Debug, Clone, EnumAsInner)]
pub enum Payload {
    /// op 0, a dispatched event
    Dispatch {
        /// event name
        name: String,
        /// sequence number
        seq: Option<u64>,
        /// raw event body
        data: Value,
    },
    /// op 1, the server wants an immediate heartbeat
    HeartbeatRequest,
    /// op 7, reconnect and resume
    Reconnect,
    /// op 9, the session is invalid; `resumable` says whether Resume may
    /// still work
    InvalidSession {
        /// whether the session can still be resumed
        resumable: bool,
    },
    /// op 10, first message of a connection
    Hello(Hello),
    /// op 11, heartbeat acknowledged
    HeartbeatAck,
    /// an opcode the state machine does not track
    Unknown {
        /// wire opcode
        op: u8,
    },
}

impl Payload {
    /// Decode one (decompressed) frame.
    pub fn decode(data: &[u8]) -> Result<Self, ParsePayloadError> {
        let envelope: Envelope =
            serde_json::from_slice(data).context(error::ParseEnvelopeFailed)?;

        let payload = match Opcode::from_u8(envelope.op) {
            Some(Opcode::Dispatch) => match envelope.t {
                Some(name) => Self::Dispatch {
                    name,
                    seq: envelope.s,
                    data: envelope.d,
                },
                // a dispatch without an event name carries nothing to route
                None => Self::Unknown { op: envelope.op },
            },
            Some(Opcode::Heartbeat) => Self::HeartbeatRequest,
            Some(Opcode::Reconnect) => Self::Reconnect,
            Some(Opcode::InvalidSession) => Self::InvalidSession {
                resumable: envelope.d.as_bool().unwrap_or(false),
            },
            Some(Opcode::Hello) => {
                let hello = serde_json::from_value(envelope.d)
                    .context(error::ParseDataFailed { op: envelope.op })?;
                Self::Hello(hello)
            }
            Some(Opcode::HeartbeatAck) => Self::HeartbeatAck,
            _ => Self::Unknown { op: envelope.op },
        };

        Ok(payload)
    }
}

/// Fields sent in an Identify payload.
#[derive(Debug, Clone)]
pub(crate) struct IdentifyFields<'a> {
    pub token: &'a str,
    pub intents: Intents,
    pub shard: Option<(u32, u32)>,
    pub large_threshold: Option<u32>,
    pub compress: bool,
}

pub(crate) fn identify(fields: &IdentifyFields<'_>) -> String {
    let mut d = json!({
        "token": fields.token,
        "intents": fields.intents.bits(),
        "properties": {
            "os": std::env::consts::OS,
            "browser": env!("CARGO_PKG_NAME"),
            "device": env!("CARGO_PKG_NAME"),
        },
    });

    if let Some((id, count)) = fields.shard {
        d["shard"] = json!([id, count]);
    }
    if let Some(threshold) = fields.large_threshold {
        d["large_threshold"] = json!(threshold);
    }
    if fields.compress {
        d["compress"] = json!(true);
    }

    json!({ "op": 2, "d": d }).to_string()
}

pub(crate) fn resume(token: &str, session_id: &str, seq: u64) -> String {
    json!({
        "op": 6,
        "d": {
            "token": token,
            "session_id": session_id,
            "seq": seq,
        },
    })
    .to_string()
}

pub(crate) fn heartbeat(seq: Option<u64>) -> String {
    json!({ "op": 1, "d": seq }).to_string()
}

pub(crate) fn presence(status: &str, activity: Option<(&str, u8)>) -> String {
    let activities = match activity {
        Some((name, kind)) => json!([{ "name": name, "type": kind }]),
        None => json!([]),
    };

    json!({
        "op": 3,
        "d": {
            "since": Value::Null,
            "status": status,
            "afk": false,
            "activities": activities,
        },
    })
    .to_string()
}

pub(crate) fn voice_state(
    guild_id: u64,
    channel_id: Option<u64>,
    self_mute: bool,
    self_deaf: bool,
) -> String {
    json!({
        "op": 4,
        "d": {
            "guild_id": guild_id.to_string(),
            "channel_id": channel_id.map(|id| id.to_string()),
            "self_mute": self_mute,
            "self_deaf": self_deaf,
        },
    })
    .to_string()
}

/// Fields sent in a Request Guild Members payload.
#[derive(Debug, Clone)]
pub(crate) struct GuildMembersFields<'a> {
    pub guild_id: u64,
    pub query: Option<&'a str>,
    pub limit: u32,
    pub presences: bool,
    pub user_ids: &'a [u64],
    pub nonce: Option<&'a str>,
}

pub(crate) fn request_guild_members(fields: &GuildMembersFields<'_>) -> String {
    let mut d = json!({ "guild_id": fields.guild_id.to_string() });

    if let Some(query) = fields.query {
        d["query"] = json!(query);
        d["limit"] = json!(fields.limit);
    } else {
        let ids: Vec<String> = fields.user_ids.iter().map(|id| id.to_string()).collect();
        d["user_ids"] = json!(ids);
    }
    if fields.presences {
        d["presences"] = json!(true);
    }
    if let Some(nonce) = fields.nonce {
        d["nonce"] = json!(nonce);
    }

    json!({ "op": 8, "d": d }).to_string()
}

pub(crate) fn request_soundboard_sounds(guild_ids: &[u64]) -> String {
    let ids: Vec<String> = guild_ids.iter().map(|id| id.to_string()).collect();
    json!({ "op": 31, "d": { "guild_ids": ids } }).to_string()
}

#[cfg(test)]
mod test {
    mod decode {
        use serde_json::json;

        use super::super::*;

        #[test]
        fn test_decode_hello() {
            let data = serde_json::to_vec(&json!({
                "op": 10,
                "d": { "heartbeat_interval": 41250 },
            }))
            .unwrap();

            let payload = Payload::decode(&data).unwrap();

            let hello = payload.into_hello().unwrap();
            assert_eq!(hello.heartbeat_interval, 41250);
        }

        #[test]
        fn test_decode_dispatch() {
            let data = serde_json::to_vec(&json!({
                "op": 0,
                "s": 42,
                "t": "MESSAGE_CREATE",
                "d": { "content": "hi" },
            }))
            .unwrap();

            let payload = Payload::decode(&data).unwrap();

            if let Payload::Dispatch { name, seq, data } = payload {
                assert_eq!(name, "MESSAGE_CREATE");
                assert_eq!(seq, Some(42));
                assert_eq!(data["content"], "hi");
            } else {
                panic!("decoded payload is not a dispatch")
            }
        }

        #[test]
        fn test_decode_invalid_session_resumable() {
            let data = serde_json::to_vec(&json!({ "op": 9, "d": true })).unwrap();

            let payload = Payload::decode(&data).unwrap();

            assert!(matches!(
                payload,
                Payload::InvalidSession { resumable: true }
            ));
        }

        #[test]
        fn test_decode_invalid_session_null_data() {
            let data = serde_json::to_vec(&json!({ "op": 9 })).unwrap();

            let payload = Payload::decode(&data).unwrap();

            assert!(matches!(
                payload,
                Payload::InvalidSession { resumable: false }
            ));
        }

        #[test]
        fn test_decode_heartbeat_ack() {
            let data = serde_json::to_vec(&json!({ "op": 11 })).unwrap();

            assert!(matches!(
                Payload::decode(&data).unwrap(),
                Payload::HeartbeatAck
            ));
        }

        #[test]
        fn test_decode_unknown_opcode() {
            let data = serde_json::to_vec(&json!({ "op": 255, "d": {} })).unwrap();

            assert!(matches!(
                Payload::decode(&data).unwrap(),
                Payload::Unknown { op: 255 }
            ));
        }

        #[test]
        fn test_decode_malformed_hello_is_error() {
            let data = serde_json::to_vec(&json!({ "op": 10, "d": {} })).unwrap();

            assert!(matches!(
                Payload::decode(&data),
                Err(ParsePayloadError::ParseDataFailed { op: 10, .. })
            ));
        }

        #[test]
        fn test_decode_garbage_is_error() {
            assert!(matches!(
                Payload::decode(b"not json"),
                Err(ParsePayloadError::ParseEnvelopeFailed { .. })
            ));
        }
    }

    mod encode {
        use serde_json::{json, Value};

        use super::super::*;

        #[test]
        fn test_identify_fields() {
            let payload = identify(&IdentifyFields {
                token: "token",
                intents: Intents::GUILDS | Intents::GUILD_MESSAGES,
                shard: Some((1, 4)),
                large_threshold: Some(150),
                compress: false,
            });

            let value: Value = serde_json::from_str(&payload).unwrap();
            assert_eq!(value["op"], 2);
            assert_eq!(value["d"]["token"], "token");
            assert_eq!(value["d"]["intents"], 513);
            assert_eq!(value["d"]["shard"], json!([1, 4]));
            assert_eq!(value["d"]["large_threshold"], 150);
            assert!(value["d"].get("compress").is_none());
            assert_eq!(value["d"]["properties"]["browser"], "fathom");
        }

        #[test]
        fn test_heartbeat_with_and_without_seq() {
            let value: Value = serde_json::from_str(&heartbeat(Some(7))).unwrap();
            assert_eq!(value, json!({ "op": 1, "d": 7 }));

            let value: Value = serde_json::from_str(&heartbeat(None)).unwrap();
            assert_eq!(value, json!({ "op": 1, "d": null }));
        }

        #[test]
        fn test_resume_carries_session_and_seq() {
            let value: Value = serde_json::from_str(&resume("token", "abc", 120)).unwrap();

            assert_eq!(value["op"], 6);
            assert_eq!(value["d"]["session_id"], "abc");
            assert_eq!(value["d"]["seq"], 120);
        }

        #[test]
        fn test_guild_members_query_mode() {
            let payload = request_guild_members(&GuildMembersFields {
                guild_id: 42,
                query: Some(""),
                limit: 0,
                presences: true,
                user_ids: &[],
                nonce: Some("n1"),
            });

            let value: Value = serde_json::from_str(&payload).unwrap();
            assert_eq!(value["op"], 8);
            assert_eq!(value["d"]["guild_id"], "42");
            assert_eq!(value["d"]["query"], "");
            assert_eq!(value["d"]["limit"], 0);
            assert_eq!(value["d"]["presences"], true);
            assert_eq!(value["d"]["nonce"], "n1");
            assert!(value["d"].get("user_ids").is_none());
        }

        #[test]
        fn test_guild_members_user_ids_mode() {
            let payload = request_guild_members(&GuildMembersFields {
                guild_id: 42,
                query: None,
                limit: 0,
                presences: false,
                user_ids: &[1, 2],
                nonce: None,
            });

            let value: Value = serde_json::from_str(&payload).unwrap();
            assert_eq!(value["d"]["user_ids"], json!(["1", "2"]));
            assert!(value["d"].get("query").is_none());
        }

        #[test]
        fn test_voice_state_disconnect_uses_null_channel() {
            let value: Value =
                serde_json::from_str(&voice_state(42, None, false, true)).unwrap();

            assert_eq!(value["op"], 4);
            assert_eq!(value["d"]["channel_id"], Value::Null);
            assert_eq!(value["d"]["self_deaf"], true);
        }
    }
}
