use thiserror::Error;

use crate::audio::opus::OpusError;
use crate::gateway::codec::DecodeError;
use crate::voice::crypto::CryptoError;
use crate::voice::udp::DiscoveryError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("authentication rejected by the gateway")]
    AuthenticationRejected,
    #[error("gateway closed the connection with non-recoverable code {code}")]
    FatalClose { code: u16 },
    #[error("not authorized to run this command")]
    AuthorizationDenied,
    #[error("disconnected (resumable, close code {0:?})")]
    DisconnectedResumable(Option<u16>),
    #[error("disconnected (session invalidated, close code {0:?})")]
    DisconnectedNonResumable(Option<u16>),
    #[error("voice negotiation timed out")]
    VoiceNegotiationTimeout,
    #[error("voice join cancelled by a newer join or a leave")]
    JoinCancelled,
    #[error("encode/decode failure: {0}")]
    EncodeDecodeFailure(String),
    #[error("command handler panicked")]
    HandlerPanic,
    #[error("connection is not established")]
    NotConnected,
    #[error("configuration error: {0}")]
    Config(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("platform returned {status}: {body}")]
    Api { status: u16, body: String },
}

impl Error {
    /// Message safe to show to an untrusted end user. Raw protocol detail stays
    /// in the logs.
    pub fn user_message(&self) -> &'static str {
        match self {
            Error::AuthorizationDenied => "You are not allowed to use this command.",
            Error::VoiceNegotiationTimeout => "Could not join the voice channel in time.",
            Error::JoinCancelled => "That voice join was replaced by another request.",
            Error::HandlerPanic => "Something went wrong while running that command.",
            Error::NotConnected => "Not connected right now, try again shortly.",
            _ => "Command failed.",
        }
    }

    /// Whether the gateway loop should give up instead of reconnecting.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::AuthenticationRejected | Error::FatalClose { .. } | Error::Config(_)
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        Error::ProtocolViolation(e.to_string())
    }
}

impl From<OpusError> for Error {
    fn from(e: OpusError) -> Self {
        Error::EncodeDecodeFailure(e.to_string())
    }
}

impl From<CryptoError> for Error {
    fn from(e: CryptoError) -> Self {
        Error::EncodeDecodeFailure(e.to_string())
    }
}

impl From<DiscoveryError> for Error {
    fn from(e: DiscoveryError) -> Self {
        match e {
            DiscoveryError::Io(io) => Error::Io(io),
            other => Error::ProtocolViolation(other.to_string()),
        }
    }
}
