pub const GUILDS: u64 = 1 << 0;
pub const GUILD_MEMBERS: u64 = 1 << 1;
pub const GUILD_MODERATION: u64 = 1 << 2;
pub const GUILD_EXPRESSIONS: u64 = 1 << 3;
pub const GUILD_INTEGRATIONS: u64 = 1 << 4;
pub const GUILD_WEBHOOKS: u64 = 1 << 5;
pub const GUILD_INVITES: u64 = 1 << 6;
pub const GUILD_VOICE_STATES: u64 = 1 << 7;
pub const GUILD_PRESENCES: u64 = 1 << 8;
pub const GUILD_MESSAGES: u64 = 1 << 9;
pub const GUILD_MESSAGE_REACTIONS: u64 = 1 << 10;
pub const GUILD_MESSAGE_TYPING: u64 = 1 << 11;
pub const DIRECT_MESSAGES: u64 = 1 << 12;
pub const DIRECT_MESSAGE_REACTIONS: u64 = 1 << 13;
pub const DIRECT_MESSAGE_TYPING: u64 = 1 << 14;
pub const MESSAGE_CONTENT: u64 = 1 << 15;

/// Intents that must be enabled in the application dashboard.
pub const PRIVILEGED: u64 = GUILD_MEMBERS | GUILD_PRESENCES | MESSAGE_CONTENT;

/// What the built-in commands need: guild lifecycle, prefix commands, voice.
pub const DEFAULT: u64 =
    GUILDS | GUILD_MESSAGES | GUILD_VOICE_STATES | DIRECT_MESSAGES | MESSAGE_CONTENT;

/// Map a dispatch event name to the intent(s) it is delivered under. Zero means
/// the event is always delivered.
pub fn intent_for_event(event_name: &str) -> u64 {
    match event_name {
        "GUILD_CREATE" | "GUILD_UPDATE" | "GUILD_DELETE" | "CHANNEL_CREATE" | "CHANNEL_UPDATE"
        | "CHANNEL_DELETE" | "GUILD_ROLE_CREATE" | "GUILD_ROLE_UPDATE" | "GUILD_ROLE_DELETE"
        | "THREAD_CREATE" | "THREAD_UPDATE" | "THREAD_DELETE" => GUILDS,
        "GUILD_MEMBER_ADD" | "GUILD_MEMBER_UPDATE" | "GUILD_MEMBER_REMOVE" => GUILD_MEMBERS,
        "GUILD_BAN_ADD" | "GUILD_BAN_REMOVE" | "GUILD_AUDIT_LOG_ENTRY_CREATE" => GUILD_MODERATION,
        "GUILD_EMOJIS_UPDATE" | "GUILD_STICKERS_UPDATE" => GUILD_EXPRESSIONS,
        "INVITE_CREATE" | "INVITE_DELETE" => GUILD_INVITES,
        "VOICE_STATE_UPDATE" => GUILD_VOICE_STATES,
        "PRESENCE_UPDATE" => GUILD_PRESENCES,
        "MESSAGE_CREATE" | "MESSAGE_UPDATE" | "MESSAGE_DELETE" | "MESSAGE_DELETE_BULK" => {
            GUILD_MESSAGES | DIRECT_MESSAGES
        }
        "MESSAGE_REACTION_ADD" | "MESSAGE_REACTION_REMOVE" | "MESSAGE_REACTION_REMOVE_ALL" => {
            GUILD_MESSAGE_REACTIONS | DIRECT_MESSAGE_REACTIONS
        }
        "TYPING_START" => GUILD_MESSAGE_TYPING | DIRECT_MESSAGE_TYPING,
        // READY, RESUMED, VOICE_SERVER_UPDATE, INTERACTION_CREATE, ...
        _ => 0,
    }
}

/// Whether `intents` lets at least one flavour of `event_name` through.
pub fn has_intent(intents: u64, event_name: &str) -> bool {
    let required = intent_for_event(event_name);
    required == 0 || intents & required != 0
}

/// Names of the events in `events` that `intents` would never deliver.
pub fn missing_for<'a>(intents: u64, events: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
    events
        .into_iter()
        .filter(|name| !has_intent(intents, name))
        .collect()
}
