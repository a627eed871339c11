pub use voicecore;

pub mod client;
pub mod config;
pub mod control;
pub mod error;
pub mod frames;
pub mod public_ip;
pub mod signaling;
pub mod status;
pub mod transmit;
pub mod udp;

pub(crate) mod context;
pub(crate) mod handshake;
pub(crate) mod keepalive;
pub(crate) mod resilience;

pub use client::{VoiceClient, VoiceClientBuilder};
pub use config::{SilencePreamble, VoiceConfig};
pub use control::{ControlPlane, ForwardedCredentials, NotificationHub};
pub use error::{ClientError, FatalError, HandshakeError, StateError, TransmitError, TransportError};
pub use status::{LogStatusChannel, NoticeKind, StatusChannel, StatusNotice};
pub use transmit::TransmitReport;
pub use voicecore::state::ConnectionState;
pub use voicecore::types::{ChannelId, GuildId, UserId, VoiceServerUpdate, VoiceStateUpdate, VoiceTarget};

#[cfg(test)]
pub(crate) mod test_utils;
