//! Immutable voice session snapshots.
//!
//! A session is never edited in place. Every change builds a new value that
//! the owner publishes as a whole, so readers always see a consistent set of
//! credentials, media parameters and sequence offset.

use crate::crypto::{EncryptionMode, KEY_SIZE};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// What the control plane handed us for one voice join.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionCredentials {
    pub session_id: String,
    pub token: String,
    pub endpoint: String,
}

impl fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("session_id", &self.session_id)
            .field("token", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Everything needed to frame and encrypt media packets.
#[derive(Clone, PartialEq, Eq)]
pub struct MediaParams {
    pub ssrc: u32,
    pub target: SocketAddr,
    pub secret_key: [u8; KEY_SIZE],
    pub mode: EncryptionMode,
}

impl fmt::Debug for MediaParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaParams")
            .field("ssrc", &self.ssrc)
            .field("target", &self.target)
            .field("secret_key", &"<redacted>")
            .field("mode", &self.mode)
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoiceSession {
    pub credentials: Option<SessionCredentials>,
    pub media: Option<MediaParams>,
    /// Subtracted from the frame index to get the packet number. Only ever
    /// decremented while media parameters stay the same.
    pub sequence_offset: i32,
    pub heartbeat_interval: Option<Duration>,
}

impl VoiceSession {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_credentials(&self, credentials: SessionCredentials) -> Self {
        Self {
            credentials: Some(credentials),
            ..self.clone()
        }
    }

    pub fn without_credentials(&self) -> Self {
        Self {
            credentials: None,
            ..self.clone()
        }
    }

    /// Replaces the endpoint of the retained credentials. No-op without credentials.
    pub fn with_endpoint(&self, endpoint: impl Into<String>) -> Self {
        let mut next = self.clone();
        if let Some(credentials) = next.credentials.as_mut() {
            credentials.endpoint = endpoint.into();
        }
        next
    }

    pub fn with_media(&self, media: MediaParams) -> Self {
        Self {
            media: Some(media),
            ..self.clone()
        }
    }

    /// Drops media parameters and starts numbering packets from zero again.
    pub fn without_media(&self) -> Self {
        Self {
            media: None,
            sequence_offset: 0,
            ..self.clone()
        }
    }

    pub fn with_heartbeat_interval(&self, interval: Duration) -> Self {
        Self {
            heartbeat_interval: Some(interval),
            ..self.clone()
        }
    }

    /// Moves the offset back by one so the next packet reuses no nonce.
    pub fn rewound(&self) -> Self {
        Self {
            sequence_offset: self.sequence_offset.wrapping_sub(1),
            ..self.clone()
        }
    }

    pub fn has_media(&self) -> bool {
        self.media.is_some()
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.credentials.as_ref().map(|c| c.endpoint.as_str())
    }
}
