//! Gateway intents sent with Identify.

bitflags::bitflags! {
    /// Event groups a session subscribes to.
    ///
    /// The bits are sent verbatim in the Identify payload. Privileged
    /// intents (members, presences, message content) must also be
    /// enabled in the application settings or the gateway closes the
    /// connection with a disallowed-intents code.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Intents: u32 {
        /// guild create/update/delete, roles, channels, threads
        const GUILDS = 1 << 0;
        /// member add/update/remove (privileged)
        const GUILD_MEMBERS = 1 << 1;
        /// bans and audit log entries
        const GUILD_MODERATION = 1 << 2;
        /// emoji and sticker updates
        const GUILD_EMOJIS_AND_STICKERS = 1 << 3;
        /// integration updates
        const GUILD_INTEGRATIONS = 1 << 4;
        /// webhook updates
        const GUILD_WEBHOOKS = 1 << 5;
        /// invite create/delete
        const GUILD_INVITES = 1 << 6;
        /// voice state updates
        const GUILD_VOICE_STATES = 1 << 7;
        /// presence updates (privileged)
        const GUILD_PRESENCES = 1 << 8;
        /// messages in guild channels
        const GUILD_MESSAGES = 1 << 9;
        /// reactions in guild channels
        const GUILD_MESSAGE_REACTIONS = 1 << 10;
        /// typing starts in guild channels
        const GUILD_MESSAGE_TYPING = 1 << 11;
        /// messages in DMs
        const DIRECT_MESSAGES = 1 << 12;
        /// reactions in DMs
        const DIRECT_MESSAGE_REACTIONS = 1 << 13;
        /// typing starts in DMs
        const DIRECT_MESSAGE_TYPING = 1 << 14;
        /// message content fields (privileged)
        const MESSAGE_CONTENT = 1 << 15;
        /// scheduled event updates
        const GUILD_SCHEDULED_EVENTS = 1 << 16;
        /// auto moderation rule changes
        const AUTO_MODERATION_CONFIGURATION = 1 << 20;
        /// auto moderation rule executions
        const AUTO_MODERATION_EXECUTION = 1 << 21;
    }
}
