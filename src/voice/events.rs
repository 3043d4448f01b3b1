use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Voice gateway opcodes (version 4).
pub mod opcode {
    pub const IDENTIFY: u8 = 0;
    pub const SELECT_PROTOCOL: u8 = 1;
    pub const READY: u8 = 2;
    pub const HEARTBEAT: u8 = 3;
    pub const SESSION_DESCRIPTION: u8 = 4;
    pub const SPEAKING: u8 = 5;
    pub const HEARTBEAT_ACK: u8 = 6;
    pub const RESUME: u8 = 7;
    pub const HELLO: u8 = 8;
    pub const RESUMED: u8 = 9;
    pub const CLIENT_DISCONNECT: u8 = 13;
}

pub mod close_code {
    pub const UNKNOWN_OPCODE: u16 = 4001;
    pub const DECODE_ERROR: u16 = 4002;
    pub const NOT_AUTHENTICATED: u16 = 4003;
    pub const AUTH_FAILED: u16 = 4004;
    pub const ALREADY_AUTHENTICATED: u16 = 4005;
    pub const SESSION_INVALID: u16 = 4006;
    pub const SESSION_TIMEOUT: u16 = 4009;
    pub const SERVER_NOT_FOUND: u16 = 4011;
    pub const UNKNOWN_PROTOCOL: u16 = 4012;
    pub const DISCONNECTED: u16 = 4014;
    pub const SERVER_CRASHED: u16 = 4015;
    pub const UNKNOWN_ENCRYPTION_MODE: u16 = 4016;
}

pub const VOICE_GATEWAY_VERSION: u8 = 4;

/// Speaking flag for normal microphone audio.
pub const SPEAKING_MICROPHONE: u8 = 1;

/// Voice gateway envelope. Unlike the main gateway there is no sequence or
/// event name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceFrame {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
}

impl VoiceFrame {
    pub fn new<T: Serialize>(op: u8, data: &T) -> Self {
        Self {
            op,
            d: serde_json::json!(data),
        }
    }

    pub fn data<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.d.clone())
    }
}

#[derive(Debug, Deserialize)]
pub struct VoiceHello {
    /// Milliseconds; sent as a float by the server.
    pub heartbeat_interval: f64,
}

#[derive(Serialize)]
pub struct VoiceIdentify {
    pub server_id: String,
    pub user_id: String,
    pub session_id: String,
    pub token: String,
}

#[derive(Serialize)]
pub struct VoiceResume {
    pub server_id: String,
    pub session_id: String,
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct VoiceReady {
    pub ssrc: u32,
    pub ip: String,
    pub port: u16,
    pub modes: Vec<String>,
}

#[derive(Serialize)]
pub struct SelectProtocol {
    pub protocol: &'static str,
    pub data: SelectProtocolData,
}

#[derive(Serialize)]
pub struct SelectProtocolData {
    pub address: String,
    pub port: u16,
    pub mode: String,
}

#[derive(Deserialize)]
pub struct SessionDescription {
    pub mode: String,
    pub secret_key: Vec<u8>,
}

#[derive(Serialize)]
pub struct OutgoingSpeaking {
    pub speaking: u8,
    pub delay: u32,
    pub ssrc: u32,
}

/// Another participant's speaking update; maps their SSRC to a user.
#[derive(Debug, Deserialize)]
pub struct IncomingSpeaking {
    pub user_id: String,
    pub ssrc: u32,
    #[serde(default)]
    pub speaking: u8,
}

#[derive(Debug, Deserialize)]
pub struct ClientDisconnect {
    pub user_id: String,
}
