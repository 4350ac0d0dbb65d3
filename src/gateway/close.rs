//! Gateway close codes and their reconnect classification.

use std::collections::HashMap;

/// Close codes the gateway uses when it ends a connection.
///
/// Standard websocket codes (1000, 1001, ...) and anything the platform
/// adds later arrive as [`CloseCode::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// 4000, something went wrong on the server
    UnknownError,
    /// 4001, an invalid opcode was sent
    UnknownOpcode,
    /// 4002, an invalid payload was sent
    DecodeError,
    /// 4003, a payload was sent before identifying
    NotAuthenticated,
    /// 4004, the token in Identify was wrong
    AuthenticationFailed,
    /// 4005, more than one Identify was sent
    AlreadyAuthenticated,
    /// 4007, the sequence sent with Resume was invalid
    InvalidSeq,
    /// 4008, payloads were sent too quickly
    RateLimited,
    /// 4009, the session timed out
    SessionTimedOut,
    /// 4010, an invalid shard was sent in Identify
    InvalidShard,
    /// 4011, the bot has too many guilds for a single connection
    ShardingRequired,
    /// 4012, an invalid API version was used
    InvalidApiVersion,
    /// 4013, invalid intent bits were sent
    InvalidIntents,
    /// 4014, a privileged intent was requested but is not enabled
    DisallowedIntents,
    /// any other code
    Other(u16),
}

impl CloseCode {
    /// The numeric wire value.
    pub fn code(self) -> u16 {
        match self {
            Self::UnknownError => 4000,
            Self::UnknownOpcode => 4001,
            Self::DecodeError => 4002,
            Self::NotAuthenticated => 4003,
            Self::AuthenticationFailed => 4004,
            Self::AlreadyAuthenticated => 4005,
            Self::InvalidSeq => 4007,
            Self::RateLimited => 4008,
            Self::SessionTimedOut => 4009,
            Self::InvalidShard => 4010,
            Self::ShardingRequired => 4011,
            Self::InvalidApiVersion => 4012,
            Self::InvalidIntents => 4013,
            Self::DisallowedIntents => 4014,
            Self::Other(code) => code,
        }
    }

    /// Human readable text for logs.
    pub fn description(self) -> &'static str {
        match self {
            Self::UnknownError => "unknown error",
            Self::UnknownOpcode => "unknown opcode",
            Self::DecodeError => "decode error",
            Self::NotAuthenticated => "not authenticated",
            Self::AuthenticationFailed => "authentication failed",
            Self::AlreadyAuthenticated => "already authenticated",
            Self::InvalidSeq => "invalid seq",
            Self::RateLimited => "rate limited",
            Self::SessionTimedOut => "session timed out",
            Self::InvalidShard => "invalid shard",
            Self::ShardingRequired => "sharding required",
            Self::InvalidApiVersion => "invalid API version",
            Self::InvalidIntents => "invalid intent(s)",
            Self::DisallowedIntents => "disallowed intent(s)",
            Self::Other(_) => "unclassified close code",
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            4000 => Self::UnknownError,
            4001 => Self::UnknownOpcode,
            4002 => Self::DecodeError,
            4003 => Self::NotAuthenticated,
            4004 => Self::AuthenticationFailed,
            4005 => Self::AlreadyAuthenticated,
            4007 => Self::InvalidSeq,
            4008 => Self::RateLimited,
            4009 => Self::SessionTimedOut,
            4010 => Self::InvalidShard,
            4011 => Self::ShardingRequired,
            4012 => Self::InvalidApiVersion,
            4013 => Self::InvalidIntents,
            4014 => Self::DisallowedIntents,
            other => Self::Other(other),
        }
    }
}

/// What a session does after the transport closes with a given code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// reconnect and resume the existing session
    Resume,
    /// the session is gone, reconnect with a fresh Identify
    Reidentify,
    /// reconnecting cannot succeed, stop and surface the code
    Fatal,
}

/// Classification table mapping close codes to a [`CloseAction`].
///
/// The platform's close code set grows over time, so the table accepts
/// per-code overrides instead of hard-coding an exhaustive match:
///
/// ```
/// use fathom::gateway::{CloseAction, ClosePolicy};
///
/// let policy = ClosePolicy::new().with_action(4015, CloseAction::Fatal);
/// assert_eq!(policy.action(4015.into()), CloseAction::Fatal);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ClosePolicy {
    overrides: HashMap<u16, CloseAction>,
}

impl ClosePolicy {
    /// Table with the documented defaults and no overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the action for one code.
    pub fn with_action(mut self, code: u16, action: CloseAction) -> Self {
        self.set(code, action);
        self
    }

    /// Add or replace the action for one code.
    pub fn set(&mut self, code: u16, action: CloseAction) {
        self.overrides.insert(code, action);
    }

    /// Look up the action for a close code.
    ///
    /// Defaults per the documented close event table: authentication,
    /// shard and intent failures are fatal; an invalid sequence or a
    /// timed out session require a fresh Identify; everything else
    /// (including standard websocket closes) may resume.
    pub fn action(&self, code: CloseCode) -> CloseAction {
        if let Some(action) = self.overrides.get(&code.code()) {
            return *action;
        }

        match code {
            CloseCode::AuthenticationFailed
            | CloseCode::InvalidShard
            | CloseCode::ShardingRequired
            | CloseCode::InvalidApiVersion
            | CloseCode::InvalidIntents
            | CloseCode::DisallowedIntents => CloseAction::Fatal,
            CloseCode::InvalidSeq | CloseCode::SessionTimedOut => CloseAction::Reidentify,
            _ => CloseAction::Resume,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_fatal_codes() {
        let policy = ClosePolicy::new();

        for code in [4004, 4010, 4011, 4012, 4013, 4014] {
            assert_eq!(policy.action(code.into()), CloseAction::Fatal, "{code}");
        }
    }

    #[test]
    fn test_default_reidentify_codes() {
        let policy = ClosePolicy::new();

        assert_eq!(policy.action(4007.into()), CloseAction::Reidentify);
        assert_eq!(policy.action(4009.into()), CloseAction::Reidentify);
    }

    #[test]
    fn test_default_resumable_codes() {
        let policy = ClosePolicy::new();

        for code in [1000, 1001, 1006, 4000, 4001, 4002, 4003, 4005, 4008] {
            assert_eq!(policy.action(code.into()), CloseAction::Resume, "{code}");
        }
    }

    #[test]
    fn test_override_wins_over_default() {
        let policy = ClosePolicy::new()
            .with_action(4000, CloseAction::Fatal)
            .with_action(4015, CloseAction::Reidentify);

        assert_eq!(policy.action(4000.into()), CloseAction::Fatal);
        assert_eq!(policy.action(4015.into()), CloseAction::Reidentify);
        assert_eq!(policy.action(4001.into()), CloseAction::Resume);
    }

    #[test]
    fn test_code_round_trip() {
        for raw in [4000u16, 4004, 4009, 4014, 1000, 4242] {
            assert_eq!(CloseCode::from(raw).code(), raw);
        }
    }
}
