//! State shared by the loops of one voice client.

use crate::config::VoiceConfig;
use crate::control::{ControlPlane, NotificationHub};
use crate::error::StateError;
use crate::keepalive::HeartbeatMonitor;
use crate::public_ip::PublicIpResolver;
use crate::signaling::SignalingChannel;
use crate::status::StatusChannel;
use log::debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use voicecore::session::VoiceSession;
use voicecore::state::ConnectionState;
use voicecore::types::VoiceTarget;

/// Two independent reasons to hold packets back: the caller asked for it, or a
/// recovery is in flight. Transmission waits while either is set.
#[derive(Debug, Default)]
pub struct PauseGate {
    user: AtomicBool,
    recovering: AtomicBool,
}

impl PauseGate {
    pub fn is_paused(&self) -> bool {
        self.user.load(Ordering::Acquire) || self.recovering.load(Ordering::Acquire)
    }

    pub fn is_user_paused(&self) -> bool {
        self.user.load(Ordering::Acquire)
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::Acquire)
    }

    pub fn set_user(&self, paused: bool) {
        self.user.store(paused, Ordering::Release);
    }

    pub(crate) fn begin_recovery(&self) {
        self.recovering.store(true, Ordering::Release);
    }

    pub(crate) fn end_recovery(&self) {
        self.recovering.store(false, Ordering::Release);
    }
}

pub(crate) struct VoiceContext {
    pub config: VoiceConfig,
    pub target: VoiceTarget,
    pub signaling: SignalingChannel,
    pub control: Arc<dyn ControlPlane>,
    pub hub: NotificationHub,
    pub status: Arc<dyn StatusChannel>,
    pub public_ip: Arc<PublicIpResolver>,
    pub heartbeat: HeartbeatMonitor,
    pub pause: PauseGate,
    /// Cancelled on dispose; every connection token is a child of it.
    pub root: CancellationToken,
    session: watch::Sender<Arc<VoiceSession>>,
    state: watch::Sender<ConnectionState>,
}

impl VoiceContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: VoiceConfig,
        target: VoiceTarget,
        signaling: SignalingChannel,
        control: Arc<dyn ControlPlane>,
        hub: NotificationHub,
        status: Arc<dyn StatusChannel>,
        public_ip: Arc<PublicIpResolver>,
    ) -> Self {
        let (session, _) = watch::channel(Arc::new(VoiceSession::empty()));
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            config,
            target,
            signaling,
            control,
            hub,
            status,
            public_ip,
            heartbeat: HeartbeatMonitor::default(),
            pause: PauseGate::default(),
            root: CancellationToken::new(),
            session,
            state,
        }
    }

    pub fn session(&self) -> Arc<VoiceSession> {
        self.session.borrow().clone()
    }

    /// Publishes a new session built from the current one.
    pub fn update_session(&self, build: impl FnOnce(&VoiceSession) -> VoiceSession) {
        self.session.send_modify(|current| *current = Arc::new(build(current)));
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Moves to `to`. Media states require media parameters in the session.
    pub fn enter(&self, to: ConnectionState) -> Result<(), StateError> {
        if to.has_media() && !self.session().has_media() {
            return Err(StateError::MissingMedia(to));
        }
        let mut result = Ok(());
        self.state.send_if_modified(|current| match current.transition(to) {
            Ok(next) if next != *current => {
                debug!(target: "Voice/State", "{current} -> {next}");
                *current = next;
                true
            }
            Ok(_) => false,
            Err(e) => {
                result = Err(e.into());
                false
            }
        });
        result
    }

    /// Streaming, or Paused if the caller asked for a pause meanwhile.
    pub fn enter_media_state(&self) -> Result<(), StateError> {
        self.enter(ConnectionState::Streaming)?;
        if self.pause.is_user_paused() {
            self.enter(ConnectionState::Paused)?;
        }
        Ok(())
    }
}
