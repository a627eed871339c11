//! Negotiation of a voice session, from the join intent to the session key.

use crate::context::VoiceContext;
use crate::error::HandshakeError;
use crate::keepalive::spawn_heartbeat;
use log::{debug, info, trace, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use voicecore::crypto::EncryptionMode;
use voicecore::protocol::{Identify, Resume, SelectProtocol, VoiceMessage, signaling_url};
use voicecore::session::{MediaParams, SessionCredentials};
use voicecore::state::ConnectionState;

type Result<T> = std::result::Result<T, HandshakeError>;

/// Outcome of a completed handshake.
#[derive(Debug, Clone)]
pub struct Established {
    pub media: MediaParams,
    pub heartbeat_interval: Duration,
}

pub(crate) struct HandshakeCoordinator {
    ctx: Arc<VoiceContext>,
}

impl HandshakeCoordinator {
    pub fn new(ctx: Arc<VoiceContext>) -> Self {
        Self { ctx }
    }

    /// Sends the join intent and waits for both control plane notifications
    /// for our target. They may arrive in either order.
    pub async fn await_assignment(&self, cancel: &CancellationToken) -> Result<SessionCredentials> {
        let ctx = &self.ctx;
        let target = ctx.target;
        let mut states = ctx.hub.subscribe_states();
        let mut servers = ctx.hub.subscribe_servers();

        info!(
            target: "Voice/Handshake",
            "Requesting to join channel {} in guild {}", target.channel_id, target.guild_id
        );
        ctx.control
            .request_join(&target)
            .await
            .map_err(HandshakeError::ControlPlane)?;

        let session_id = wait_for(&mut states, |update| {
            target.matches_state(&update).then_some(update.session_id)
        });
        let server = wait_for(&mut servers, |update| {
            if !target.matches_server(&update) {
                if update.guild_id == target.guild_id {
                    debug!(target: "Voice/Handshake", "Voice server is being reallocated, waiting");
                }
                return None;
            }
            update.endpoint.map(|endpoint| (update.token, endpoint))
        });

        let deadline = Instant::now() + ctx.config.join_timeout();
        let (session_id, (token, endpoint)) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(HandshakeError::Cancelled),
            joined = timeout_at(deadline, async { tokio::try_join!(session_id, server) }) => {
                joined.map_err(|_| HandshakeError::Timeout("voice assignment"))??
            }
        };

        debug!(target: "Voice/Handshake", "Assigned voice endpoint {endpoint}");
        Ok(SessionCredentials {
            session_id,
            token,
            endpoint,
        })
    }

    /// Opens the signaling socket and negotiates media parameters. The
    /// heartbeat starts as soon as the server says hello.
    pub async fn establish(
        &self,
        credentials: &SessionCredentials,
        connection: &CancellationToken,
    ) -> Result<Established> {
        let ctx = &self.ctx;
        let url = signaling_url(&credentials.endpoint, ctx.config.gateway_version);
        ctx.signaling.connect(&url).await?;
        ctx.enter(ConnectionState::AwaitingHello)?;

        let identify = Identify::new(
            ctx.target.guild_id,
            ctx.target.user_id,
            credentials.session_id.as_str(),
            credentials.token.as_str(),
        )?;
        ctx.signaling.send(&VoiceMessage::Identify(identify)).await?;

        let hello = self
            .next_matching("Hello", connection, |m| match m {
                VoiceMessage::Hello(hello) => Some(hello),
                _ => None,
            })
            .await?;
        let heartbeat_interval = hello.interval()?;
        spawn_heartbeat(ctx.clone(), heartbeat_interval, connection.clone());
        ctx.enter(ConnectionState::AwaitingReady)?;

        let ready = self
            .next_matching("Ready", connection, |m| match m {
                VoiceMessage::Ready(ready) => Some(ready),
                _ => None,
            })
            .await?;
        ctx.enter(ConnectionState::SelectingProtocol)?;

        // Servers that list no modes speak the default one.
        let mode = if ready.modes.is_empty() {
            EncryptionMode::XSalsa20Poly1305
        } else {
            EncryptionMode::negotiate(&ready.modes)
                .ok_or_else(|| HandshakeError::NoSupportedMode(ready.modes.clone()))?
        };
        let remote = SocketAddr::new(ready.ip_addr()?, ready.port);
        let address = ctx
            .public_ip
            .resolve()
            .await
            .map_err(HandshakeError::PublicIp)?;
        ctx.signaling
            .send(&VoiceMessage::SelectProtocol(SelectProtocol::udp(
                address, ready.port, mode,
            )))
            .await?;
        ctx.enter(ConnectionState::AwaitingSessionDescription)?;

        let description = self
            .next_matching("SessionDescription", connection, |m| match m {
                VoiceMessage::SessionDescription(description) => Some(description),
                _ => None,
            })
            .await?;
        let secret_key = description.secret_key()?;
        let mode = if description.mode.is_empty() {
            mode
        } else {
            EncryptionMode::from_wire(&description.mode)
                .ok_or_else(|| HandshakeError::UnexpectedMode(description.mode.clone()))?
        };

        info!(
            target: "Voice/Handshake",
            "Voice session established: ssrc {}, media to {remote}, mode {mode}", ready.ssrc
        );
        Ok(Established {
            media: MediaParams {
                ssrc: ready.ssrc,
                target: remote,
                secret_key,
                mode,
            },
            heartbeat_interval,
        })
    }

    /// Reopens the socket to the same endpoint and resumes the session.
    /// Returns the heartbeat interval if the server sent a fresh hello.
    pub async fn resume(
        &self,
        credentials: &SessionCredentials,
        connection: &CancellationToken,
    ) -> Result<Option<Duration>> {
        let ctx = &self.ctx;
        let url = signaling_url(&credentials.endpoint, ctx.config.gateway_version);
        ctx.signaling.connect(&url).await?;
        ctx.signaling
            .send(&VoiceMessage::Resume(Resume {
                server_id: ctx.target.guild_id,
                session_id: credentials.session_id.clone(),
                token: credentials.token.clone(),
            }))
            .await?;

        let deadline = Instant::now() + ctx.config.resume_timeout();
        let mut interval = None;
        loop {
            match self.receive_until(deadline, "Resumed", connection).await? {
                Some(VoiceMessage::Resumed) => return Ok(interval),
                Some(VoiceMessage::Hello(hello)) => interval = Some(hello.interval()?),
                Some(VoiceMessage::HeartbeatAck(nonce)) => {
                    ctx.heartbeat.ack(nonce, chrono::Utc::now());
                }
                Some(other) => {
                    trace!(target: "Voice/Handshake", "Ignoring {} while resuming", other.name());
                }
                None => return Err(HandshakeError::ResumeRejected),
            }
        }
    }

    async fn receive_until(
        &self,
        deadline: Instant,
        what: &'static str,
        connection: &CancellationToken,
    ) -> Result<Option<VoiceMessage>> {
        tokio::select! {
            biased;
            _ = connection.cancelled() => Err(HandshakeError::Cancelled),
            received = timeout_at(deadline, self.ctx.signaling.receive()) => {
                Ok(received.map_err(|_| HandshakeError::Timeout(what))??)
            }
        }
    }

    /// Reads messages until `pick` accepts one, ignoring everything else.
    async fn next_matching<T>(
        &self,
        what: &'static str,
        connection: &CancellationToken,
        mut pick: impl FnMut(VoiceMessage) -> Option<T>,
    ) -> Result<T> {
        let deadline = Instant::now() + self.ctx.config.handshake_timeout();
        loop {
            let Some(message) = self.receive_until(deadline, what, connection).await? else {
                continue;
            };
            if let VoiceMessage::HeartbeatAck(nonce) = message {
                self.ctx.heartbeat.ack(nonce, chrono::Utc::now());
                continue;
            }
            let name = message.name();
            match pick(message) {
                Some(value) => return Ok(value),
                None => trace!(target: "Voice/Handshake", "Ignoring {name} while waiting for {what}"),
            }
        }
    }
}

/// Waits for the first notification `accept` maps to a value.
async fn wait_for<T: Clone, R>(
    rx: &mut broadcast::Receiver<T>,
    mut accept: impl FnMut(T) -> Option<R>,
) -> Result<R> {
    loop {
        match rx.recv().await {
            Ok(update) => {
                if let Some(value) = accept(update) {
                    return Ok(value);
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(target: "Voice/Handshake", "Missed {skipped} control plane notifications");
            }
            Err(RecvError::Closed) => return Err(HandshakeError::NotificationsClosed),
        }
    }
}
