use thiserror::Error;
use voicecore::packet::PacketError;
use voicecore::protocol::{LossKind, ProtocolError};
use voicecore::state::{ConnectionState, InvalidTransition};

/// Failures at the signaling socket boundary, tagged with what the caller
/// needs to decide between resume and full reconnect.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Signaling socket is not connected")]
    NotConnected,
    #[error("Signaling channel has been shut down")]
    ShutDown,
    #[error("Failed to open signaling socket: {0}")]
    Connect(anyhow::Error),
    #[error("Failed to send signaling frame: {0}")]
    Send(anyhow::Error),
    #[error("Failed to encode signaling frame: {0}")]
    Encode(#[from] ProtocolError),
    #[error("Signaling socket closed (code {code:?})")]
    Closed { code: Option<u16> },
    #[error("Media packet send failed: {0}")]
    Media(#[from] std::io::Error),
}

impl TransportError {
    pub fn close_code(&self) -> Option<u16> {
        match self {
            TransportError::Closed { code } => *code,
            _ => None,
        }
    }

    pub fn loss_kind(&self) -> LossKind {
        LossKind::from_close_code(self.close_code())
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
    #[error("State {0} requires media parameters in the session")]
    MissingMedia(ConnectionState),
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("Control plane rejected the join request: {0}")]
    ControlPlane(anyhow::Error),
    #[error("Failed to discover public address: {0}")]
    PublicIp(anyhow::Error),
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("Notification stream closed")]
    NotificationsClosed,
    #[error("No supported encryption mode offered (server offered {0:?})")]
    NoSupportedMode(Vec<String>),
    #[error("Server picked unsupported encryption mode {0:?}")]
    UnexpectedMode(String),
    #[error("Session has no credentials to resume")]
    MissingCredentials,
    #[error("Server sent an unreadable frame while resuming")]
    ResumeRejected,
    #[error("Handshake cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum FatalError {
    #[error("Voice client has been disposed")]
    Disposed,
}

#[derive(Debug, Error)]
pub enum TransmitError {
    #[error("Media framing invariant violated: {0}")]
    Invariant(#[from] PacketError),
    #[error("Signaling error: {0}")]
    Signaling(#[from] TransportError),
    #[error(transparent)]
    Fatal(#[from] FatalError),
    #[error("Connection could not be recovered")]
    RecoveryFailed,
    #[error("Media packet send failed after recovery: {0}")]
    SendFailed(std::io::Error),
    #[error("Voice connection is faulted")]
    Faulted,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Voice handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("Transmission failed: {0}")]
    Transmit(#[from] TransmitError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("Failed to bind media socket: {0}")]
    Bind(std::io::Error),
    #[error("Missing builder field: {0}")]
    Builder(&'static str),
    #[error("Voice client is already connecting or connected")]
    AlreadyConnected,
    #[error("Voice client is not connected")]
    NotConnected,
    #[error("A transmission is already running")]
    AlreadyTransmitting,
    #[error("Voice client has been disposed")]
    Disposed,
}
