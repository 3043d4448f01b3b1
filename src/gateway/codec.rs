use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use super::events::opcode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Dispatch,
    Heartbeat,
    Identify,
    PresenceUpdate,
    VoiceStateUpdate,
    Resume,
    Reconnect,
    RequestGuildMembers,
    InvalidSession,
    Hello,
    HeartbeatAck,
    /// Opcodes this client does not know yet. Payload is passed through as-is.
    Unknown(u8),
}

impl Opcode {
    pub fn from_u8(op: u8) -> Self {
        match op {
            opcode::DISPATCH => Opcode::Dispatch,
            opcode::HEARTBEAT => Opcode::Heartbeat,
            opcode::IDENTIFY => Opcode::Identify,
            opcode::PRESENCE_UPDATE => Opcode::PresenceUpdate,
            opcode::VOICE_STATE_UPDATE => Opcode::VoiceStateUpdate,
            opcode::RESUME => Opcode::Resume,
            opcode::RECONNECT => Opcode::Reconnect,
            opcode::REQUEST_GUILD_MEMBERS => Opcode::RequestGuildMembers,
            opcode::INVALID_SESSION => Opcode::InvalidSession,
            opcode::HELLO => Opcode::Hello,
            opcode::HEARTBEAT_ACK => Opcode::HeartbeatAck,
            other => Opcode::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Dispatch => opcode::DISPATCH,
            Opcode::Heartbeat => opcode::HEARTBEAT,
            Opcode::Identify => opcode::IDENTIFY,
            Opcode::PresenceUpdate => opcode::PRESENCE_UPDATE,
            Opcode::VoiceStateUpdate => opcode::VOICE_STATE_UPDATE,
            Opcode::Resume => opcode::RESUME,
            Opcode::Reconnect => opcode::RECONNECT,
            Opcode::RequestGuildMembers => opcode::REQUEST_GUILD_MEMBERS,
            Opcode::InvalidSession => opcode::INVALID_SESSION,
            Opcode::Hello => opcode::HELLO,
            Opcode::HeartbeatAck => opcode::HEARTBEAT_ACK,
            Opcode::Unknown(op) => op,
        }
    }
}

/// Gateway message envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayFrame {
    pub opcode: Opcode,
    pub sequence: Option<u64>,
    pub event_name: Option<String>,
    pub payload: Value,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid opcode {0}")]
    InvalidOpcode(String),
    #[error("unexpected payload for opcode {op}: {source}")]
    Payload {
        op: u8,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(default)]
    op: Option<Value>,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
    #[serde(default)]
    d: Option<Value>,
}

impl GatewayFrame {
    pub fn new(opcode: Opcode, payload: Value) -> Self {
        Self {
            opcode,
            sequence: None,
            event_name: None,
            payload,
        }
    }

    pub fn dispatch(sequence: u64, event_name: &str, payload: Value) -> Self {
        Self {
            opcode: Opcode::Dispatch,
            sequence: Some(sequence),
            event_name: Some(event_name.to_string()),
            payload,
        }
    }

    pub fn heartbeat(last_sequence: Option<u64>) -> Self {
        Self::new(Opcode::Heartbeat, json!(last_sequence))
    }

    pub fn with_data<T: Serialize>(opcode: Opcode, data: &T) -> Self {
        Self::new(opcode, json!(data))
    }

    /// Deserialize the payload into a typed struct.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        serde_json::from_value(self.payload.clone()).map_err(|source| DecodeError::Payload {
            op: self.opcode.as_u8(),
            source,
        })
    }
}

/// Serialize a frame to its JSON text form.
pub fn encode(frame: &GatewayFrame) -> String {
    let mut obj = serde_json::Map::new();
    obj.insert("op".to_string(), json!(frame.opcode.as_u8()));
    obj.insert("d".to_string(), frame.payload.clone());
    if let Some(seq) = frame.sequence {
        obj.insert("s".to_string(), json!(seq));
    }
    if let Some(ref name) = frame.event_name {
        obj.insert("t".to_string(), json!(name));
    }
    Value::Object(obj).to_string()
}

/// Parse a text or binary websocket payload into a frame.
pub fn decode(bytes: &[u8]) -> Result<GatewayFrame, DecodeError> {
    let raw: RawFrame = serde_json::from_slice(bytes)?;

    let op = match raw.op {
        None | Some(Value::Null) => return Err(DecodeError::MissingField("op")),
        Some(v) => v
            .as_u64()
            .and_then(|n| u8::try_from(n).ok())
            .ok_or_else(|| DecodeError::InvalidOpcode(v.to_string()))?,
    };
    let opcode = Opcode::from_u8(op);

    if opcode == Opcode::Dispatch {
        if raw.s.is_none() {
            return Err(DecodeError::MissingField("s"));
        }
        if raw.t.is_none() {
            return Err(DecodeError::MissingField("t"));
        }
    }

    Ok(GatewayFrame {
        opcode,
        sequence: raw.s,
        event_name: raw.t,
        payload: raw.d.unwrap_or(Value::Null),
    })
}
