use serde::{Deserialize, Serialize};

/// Opcodes for gateway messages.
pub mod opcode {
    pub const DISPATCH: u8 = 0;
    pub const HEARTBEAT: u8 = 1;
    pub const IDENTIFY: u8 = 2;
    pub const PRESENCE_UPDATE: u8 = 3;
    pub const VOICE_STATE_UPDATE: u8 = 4;
    pub const RESUME: u8 = 6;
    pub const RECONNECT: u8 = 7;
    pub const REQUEST_GUILD_MEMBERS: u8 = 8;
    pub const INVALID_SESSION: u8 = 9;
    pub const HELLO: u8 = 10;
    pub const HEARTBEAT_ACK: u8 = 11;
}

/// Close codes.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const UNKNOWN_ERROR: u16 = 4000;
    pub const UNKNOWN_OPCODE: u16 = 4001;
    pub const DECODE_ERROR: u16 = 4002;
    pub const NOT_AUTHENTICATED: u16 = 4003;
    pub const AUTH_FAILED: u16 = 4004;
    pub const ALREADY_AUTHENTICATED: u16 = 4005;
    pub const INVALID_SEQ: u16 = 4007;
    pub const RATE_LIMITED: u16 = 4008;
    pub const SESSION_TIMED_OUT: u16 = 4009;
    pub const INVALID_SHARD: u16 = 4010;
    pub const SHARDING_REQUIRED: u16 = 4011;
    pub const INVALID_API_VERSION: u16 = 4012;
    pub const INVALID_INTENTS: u16 = 4013;
    pub const DISALLOWED_INTENTS: u16 = 4014;
    /// Sent by us when tearing down a connection we intend to resume. Any
    /// close code other than 1000/1001 keeps the session resumable.
    pub const CLIENT_RECONNECT: u16 = 4900;
}

/// Dispatch event names the core itself reacts to.
pub mod event_name {
    pub const READY: &str = "READY";
    pub const RESUMED: &str = "RESUMED";
    pub const GUILD_CREATE: &str = "GUILD_CREATE";
    pub const GUILD_DELETE: &str = "GUILD_DELETE";
    pub const MESSAGE_CREATE: &str = "MESSAGE_CREATE";
    pub const VOICE_STATE_UPDATE: &str = "VOICE_STATE_UPDATE";
    pub const VOICE_SERVER_UPDATE: &str = "VOICE_SERVER_UPDATE";
}

/// A decoded dispatch, as handed to the event loop.
#[derive(Debug, Clone)]
pub struct DispatchEvent {
    pub shard_id: u32,
    pub sequence: u64,
    pub name: String,
    pub payload: serde_json::Value,
}

/// HELLO (opcode 10) payload data.
#[derive(Debug, Deserialize)]
pub struct HelloData {
    pub heartbeat_interval: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: "accordbot".to_string(),
            device: "accordbot".to_string(),
        }
    }
}

/// IDENTIFY (opcode 2) payload data.
#[derive(Debug, Clone, Serialize)]
pub struct IdentifyData {
    pub token: String,
    pub intents: u64,
    pub properties: ConnectionProperties,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<[u32; 2]>,
}

/// RESUME (opcode 6) payload data.
#[derive(Debug, Clone, Serialize)]
pub struct ResumeData {
    pub token: String,
    pub session_id: String,
    pub seq: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub bot: bool,
}

/// READY dispatch payload (fields the session needs).
#[derive(Debug, Deserialize)]
pub struct ReadyData {
    pub session_id: String,
    pub resume_gateway_url: String,
    pub user: User,
    #[serde(default)]
    pub shard: Option<[u32; 2]>,
}

/// VOICE_STATE_UPDATE (opcode 4) outbound payload data.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateVoiceStateData {
    pub guild_id: String,
    pub channel_id: Option<String>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

/// Online status shown next to the bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OnlineStatus {
    Online,
    Idle,
    Dnd,
    Invisible,
}

impl std::str::FromStr for OnlineStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "online" => Ok(OnlineStatus::Online),
            "idle" => Ok(OnlineStatus::Idle),
            "dnd" => Ok(OnlineStatus::Dnd),
            "invisible" => Ok(OnlineStatus::Invisible),
            other => Err(format!("unknown status {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Activity {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: u8,
}

impl Activity {
    pub fn watching(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            // 0 playing, 2 listening, 3 watching
            kind: 3,
        }
    }
}

/// PRESENCE_UPDATE (opcode 3) outbound payload data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceData {
    pub since: Option<u64>,
    pub activities: Vec<Activity>,
    pub status: OnlineStatus,
    pub afk: bool,
}

impl PresenceData {
    pub fn new(activity: Option<Activity>, status: OnlineStatus) -> Self {
        Self {
            since: None,
            activities: activity.into_iter().collect(),
            status,
            afk: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemberData {
    pub user: User,
}

/// VOICE_STATE_UPDATE dispatch payload.
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceStateData {
    #[serde(default)]
    pub guild_id: Option<String>,
    pub channel_id: Option<String>,
    pub user_id: String,
    pub session_id: String,
    #[serde(default)]
    pub member: Option<MemberData>,
}

impl VoiceStateData {
    pub fn is_bot(&self) -> bool {
        self.member.as_ref().is_some_and(|m| m.user.bot)
    }
}

/// VOICE_SERVER_UPDATE dispatch payload.
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceServerData {
    pub token: String,
    pub guild_id: String,
    /// Null while the platform is allocating a new voice server.
    pub endpoint: Option<String>,
}

/// MESSAGE_CREATE dispatch payload (fields the dispatcher needs).
#[derive(Debug, Clone, Deserialize)]
pub struct MessageData {
    pub id: String,
    pub channel_id: String,
    #[serde(default)]
    pub guild_id: Option<String>,
    pub author: User,
    #[serde(default)]
    pub content: String,
}

/// GUILD_CREATE dispatch payload, trimmed to what the voice state cache needs.
#[derive(Debug, Deserialize)]
pub struct GuildCreateData {
    pub id: String,
    #[serde(default)]
    pub voice_states: Vec<VoiceStateData>,
}

/// GUILD_DELETE dispatch payload.
#[derive(Debug, Deserialize)]
pub struct GuildDeleteData {
    pub id: String,
    #[serde(default)]
    pub unavailable: bool,
}
