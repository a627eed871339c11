//! User-visible notices about the voice connection.

use log::warn;
use voicecore::protocol::LossKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    ServerChanged,
    SessionInvalidated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusNotice {
    pub kind: NoticeKind,
    pub message: String,
}

impl StatusNotice {
    /// The notice for a fatal signaling loss. Transient losses have none.
    pub fn for_loss(kind: LossKind) -> Option<Self> {
        match kind {
            LossKind::Transient => None,
            LossKind::ServerChanged => Some(Self {
                kind: NoticeKind::ServerChanged,
                message: "Voice server changed or we were disconnected, reconnecting".to_string(),
            }),
            LossKind::SessionInvalid => Some(Self {
                kind: NoticeKind::SessionInvalidated,
                message: "Voice session is no longer valid, starting a new one".to_string(),
            }),
        }
    }
}

/// Where status notices go, e.g. a text channel the bot posts to.
pub trait StatusChannel: Send + Sync {
    fn notify(&self, notice: &StatusNotice);
}

/// Writes notices to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatusChannel;

impl StatusChannel for LogStatusChannel {
    fn notify(&self, notice: &StatusNotice) {
        warn!(target: "Voice/Status", "{:?}: {}", notice.kind, notice.message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_losses_have_distinct_notices() {
        let changed = StatusNotice::for_loss(LossKind::ServerChanged).unwrap();
        let invalid = StatusNotice::for_loss(LossKind::SessionInvalid).unwrap();
        assert_eq!(changed.kind, NoticeKind::ServerChanged);
        assert_eq!(invalid.kind, NoticeKind::SessionInvalidated);
        assert_ne!(changed.message, invalid.message);
        assert!(StatusNotice::for_loss(LossKind::Transient).is_none());
    }
}
