pub mod connection;
pub mod crypto;
pub mod events;
pub mod follower;
pub mod manager;
pub mod state;
pub mod transport;
pub mod udp;

pub use connection::{VoicePhase, VoiceSessionState};
pub use crypto::EncryptionMode;
pub use follower::VoiceFollower;
pub use manager::{Call, VoiceConfig, VoiceManager, VoiceStateSender};
pub use state::VoiceStateCache;
