pub mod codec;
pub mod dispatcher;
pub mod events;
pub mod heartbeat;
pub mod intents;
pub mod session;

pub use codec::{decode, encode, DecodeError, GatewayFrame, Opcode};
pub use dispatcher::{CommandDispatcher, DispatcherBuilder, Invocation, Privilege};
pub use events::DispatchEvent;
pub use session::{GatewayConfig, GatewayHandle, GatewaySession, SessionState};
