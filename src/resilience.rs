//! Recovery from a lost signaling connection: resume when the session is
//! still good, otherwise renegotiate from scratch.
//!
//! Every successful (re)connect starts a new connection generation with its
//! own cancellation token. Losses are reported against the generation they
//! were seen on, so a loss noticed by several loops recovers only once.

use crate::context::VoiceContext;
use crate::error::{FatalError, HandshakeError, TransportError};
use crate::handshake::HandshakeCoordinator;
use crate::keepalive::spawn_heartbeat;
use crate::status::StatusNotice;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use voicecore::state::ConnectionState;

pub struct ResilienceManager {
    ctx: Arc<VoiceContext>,
    handshake: HandshakeCoordinator,
    recovery: Mutex<()>,
    generation: AtomicU64,
    connection: std::sync::Mutex<CancellationToken>,
}

impl ResilienceManager {
    pub(crate) fn new(ctx: Arc<VoiceContext>) -> Arc<Self> {
        let connection = ctx.root.child_token();
        Arc::new(Self {
            handshake: HandshakeCoordinator::new(ctx.clone()),
            ctx,
            recovery: Mutex::new(()),
            generation: AtomicU64::new(0),
            connection: std::sync::Mutex::new(connection),
        })
    }

    pub(crate) fn context(&self) -> &Arc<VoiceContext> {
        &self.ctx
    }

    /// Number of connections established so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// The initial join. Failures are returned as is, never retried.
    pub(crate) async fn connect(self: &Arc<Self>) -> Result<(), HandshakeError> {
        let _recovery = self.recovery.lock().await;
        self.full_handshake().await
    }

    /// Handles a loss seen on connection `generation`.
    ///
    /// `Ok(true)` once streaming can continue, `Ok(false)` if neither resume
    /// nor a full reconnect worked and the client is now faulted.
    pub async fn on_transport_lost(
        self: &Arc<Self>,
        error: TransportError,
        generation: u64,
    ) -> Result<bool, FatalError> {
        let ctx = &self.ctx;
        if ctx.root.is_cancelled() {
            return Err(FatalError::Disposed);
        }

        let _recovery = tokio::select! {
            biased;
            _ = ctx.root.cancelled() => return Err(FatalError::Disposed),
            guard = self.recovery.lock() => guard,
        };

        if self.generation() != generation {
            debug!(
                target: "Voice/Resilience",
                "Loss on generation {generation} already handled: {error}"
            );
            return self.outcome(ctx.state() != ConnectionState::Faulted);
        }
        if ctx.state().is_terminal() {
            return self.outcome(false);
        }

        ctx.pause.begin_recovery();
        let recovered = match StatusNotice::for_loss(error.loss_kind()) {
            Some(notice) => {
                warn!(target: "Voice/Resilience", "Fatal signaling loss ({error}), reconnecting from scratch");
                ctx.status.notify(&notice);
                // Neither the old session nor the old endpoint can be used again.
                ctx.update_session(|s| s.without_credentials());
                self.reconnect().await
            }
            None => {
                info!(target: "Voice/Resilience", "Signaling connection lost ({error}), resuming");
                match self.resume().await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(target: "Voice/Resilience", "Resume failed ({e}), falling back to a full reconnect");
                        self.reconnect().await
                    }
                }
            }
        };

        if recovered {
            ctx.pause.end_recovery();
            info!(target: "Voice/Resilience", "Voice connection recovered");
        } else if !ctx.root.is_cancelled() {
            error!(target: "Voice/Resilience", "Voice connection could not be recovered");
            self.next_connection();
            ctx.signaling.close().await;
            if let Err(e) = ctx.enter(ConnectionState::Faulted) {
                debug!(target: "Voice/Resilience", "Not marking faulted: {e}");
            }
        }
        self.outcome(recovered)
    }

    fn outcome(&self, recovered: bool) -> Result<bool, FatalError> {
        if self.ctx.root.is_cancelled() {
            Err(FatalError::Disposed)
        } else {
            Ok(recovered)
        }
    }

    async fn resume(self: &Arc<Self>) -> Result<(), HandshakeError> {
        let ctx = &self.ctx;
        let session = ctx.session();
        let credentials = session
            .credentials
            .clone()
            .ok_or(HandshakeError::MissingCredentials)?;
        ctx.enter(ConnectionState::Resuming)?;

        let connection = self.next_connection();
        let interval = self.handshake.resume(&credentials, &connection).await?;
        let interval = interval
            .or(session.heartbeat_interval)
            .ok_or(HandshakeError::Timeout("Hello"))?;
        ctx.update_session(|s| s.with_heartbeat_interval(interval));
        spawn_heartbeat(ctx.clone(), interval, connection.clone());

        ctx.enter_media_state()?;
        self.start_generation(connection);
        Ok(())
    }

    async fn reconnect(self: &Arc<Self>) -> bool {
        match self.full_handshake().await {
            Ok(()) => true,
            Err(e) => {
                error!(target: "Voice/Resilience", "Full reconnect failed: {e}");
                false
            }
        }
    }

    /// Runs the handshake from the socket step with the credentials we still
    /// hold, or from the join intent when there are none.
    async fn full_handshake(self: &Arc<Self>) -> Result<(), HandshakeError> {
        let ctx = &self.ctx;
        let connection = self.next_connection();
        ctx.signaling.close().await;
        ctx.enter(ConnectionState::Connecting)?;
        ctx.update_session(|s| s.without_media());

        let credentials = match ctx.session().credentials.clone() {
            Some(credentials) => credentials,
            None => {
                let credentials = self.handshake.await_assignment(&connection).await?;
                ctx.update_session(|s| s.with_credentials(credentials.clone()));
                credentials
            }
        };

        let established = self.handshake.establish(&credentials, &connection).await?;
        ctx.update_session(|s| {
            s.with_media(established.media.clone())
                .with_heartbeat_interval(established.heartbeat_interval)
        });
        ctx.enter_media_state()?;
        self.start_generation(connection);
        Ok(())
    }

    /// Cancels the current connection's loops and hands out a fresh token.
    fn next_connection(&self) -> CancellationToken {
        let token = self.ctx.root.child_token();
        let previous = std::mem::replace(
            &mut *self
                .connection
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            token.clone(),
        );
        previous.cancel();
        token
    }

    fn start_generation(self: &Arc<Self>, connection: CancellationToken) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(target: "Voice/Resilience", "Starting connection generation {generation}");
        tokio::spawn(crate::client::receive_loop(
            self.clone(),
            generation,
            connection,
        ));
    }
}
