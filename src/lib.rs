//! Voice Room - peer-to-peer voice rooms
//!
//! This library provides the presence registry and signaling relay run by the
//! server, and the peer connection orchestrator and session coordinator run by
//! each client.

pub mod config;
pub mod media;
pub mod orchestrator;
pub mod protocol;
pub mod relay;
pub mod room;
pub mod rtc;
pub mod session;
pub mod transport;

#[cfg(feature = "device-audio")]
pub mod audio;
#[cfg(feature = "device-audio")]
pub mod audio_codec;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ClientConfig, ServerConfig};
pub use orchestrator::{LinkPhase, Orchestrator, OrchestratorError};
pub use protocol::SignalingMessage;
pub use relay::{PresenceStore, Relay, RelayEvent};
pub use room::{Member, MemberId, Room, RoomRegistry};
pub use session::{Session, SessionCommand, SessionEvent};
