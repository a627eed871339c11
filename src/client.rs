use crate::config::VoiceConfig;
use crate::context::VoiceContext;
use crate::control::{ControlPlane, NotificationHub};
use crate::error::{ClientError, FatalError, TransportError};
use crate::public_ip::PublicIpResolver;
use crate::resilience::ResilienceManager;
use crate::signaling::SignalingChannel;
use crate::status::{LogStatusChannel, StatusChannel};
use crate::transmit::{AudioTransmitter, Pacing, TransmitLink, TransmitReport};
use crate::udp::{MediaSocket, UdpMediaSocket};
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use voicecore::crypto::EncryptionMode;
use voicecore::net::{HttpClient, TransportFactory};
use voicecore::protocol::{Speaking, VoiceMessage};
use voicecore::session::{MediaParams, VoiceSession};
use voicecore::state::ConnectionState;
use voicecore::types::VoiceTarget;
use voicelink_tokio_transport::TokioWebSocketTransportFactory;
use voicelink_ureq_http_client::UreqHttpClient;

/// A voice connection to one channel. Owned explicitly by whoever manages
/// the bot's voice presence; there is no global instance.
pub struct VoiceClient {
    ctx: Arc<VoiceContext>,
    resilience: Arc<ResilienceManager>,
    /// Taken out on dispose so the UDP socket closes with the client.
    media_socket: StdMutex<Option<Arc<dyn MediaSocket>>>,
    transmitting: Mutex<()>,
    is_connecting: AtomicBool,
    disposed: AtomicBool,
}

impl VoiceClient {
    pub fn builder(target: VoiceTarget) -> VoiceClientBuilder {
        VoiceClientBuilder::new(target)
    }

    /// Joins the target channel and negotiates a voice session.
    ///
    /// A failed handshake is not retried: the client is disposed and the
    /// error returned.
    pub async fn connect(&self) -> Result<(), ClientError> {
        if self.is_disposed() {
            return Err(ClientError::Disposed);
        }
        if self.is_connecting.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadyConnected);
        }
        let _guard = scopeguard::guard((), |_| {
            self.is_connecting.store(false, Ordering::Relaxed);
        });
        if self.ctx.state() != ConnectionState::Idle {
            return Err(ClientError::AlreadyConnected);
        }

        if self.media_socket().is_none() {
            match UdpMediaSocket::bind().await {
                Ok(socket) => *self.lock_media_socket() = Some(Arc::new(socket)),
                Err(e) => {
                    error!(target: "Voice/Client", "Failed to bind media socket: {e}");
                    self.dispose().await;
                    return Err(ClientError::Bind(e));
                }
            }
        }

        let endpoint_updates = self.ctx.hub.subscribe_servers();
        match self.resilience.connect().await {
            Ok(()) => {
                info!(target: "Voice/Client", "Voice connection ready");
                tokio::spawn(watch_endpoint(self.ctx.clone(), endpoint_updates));
                Ok(())
            }
            Err(e) => {
                error!(target: "Voice/Client", "Voice handshake failed: {e}");
                self.dispose().await;
                Err(ClientError::Handshake(e))
            }
        }
    }

    /// Streams `frames` until they run out or the client is disposed.
    pub async fn play<I>(&self, frames: I) -> Result<TransmitReport, ClientError>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        self.play_until(frames, &CancellationToken::new()).await
    }

    /// Like [`play`](Self::play), also stopping when `cancel` fires.
    pub async fn play_until<I>(
        &self,
        frames: I,
        cancel: &CancellationToken,
    ) -> Result<TransmitReport, ClientError>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        if self.is_disposed() {
            return Err(ClientError::Disposed);
        }
        let socket = self.media_socket().ok_or(ClientError::NotConnected)?;
        if self.ctx.state() == ConnectionState::Idle {
            return Err(ClientError::NotConnected);
        }
        let _transmitting = self
            .transmitting
            .try_lock()
            .map_err(|_| ClientError::AlreadyTransmitting)?;

        let transmitter = AudioTransmitter::new(
            Arc::new(ClientLink {
                resilience: self.resilience.clone(),
            }),
            socket,
            Pacing::from_config(&self.ctx.config),
            self.ctx.config.silence_preamble.clone(),
        );

        let linked = self.ctx.root.child_token();
        let transmission = transmitter.transmit(frames, &linked);
        tokio::pin!(transmission);
        let result = loop {
            tokio::select! {
                result = &mut transmission => break result,
                _ = cancel.cancelled(), if !linked.is_cancelled() => linked.cancel(),
            }
        };
        Ok(result?)
    }

    /// Holds packets back without leaving the channel.
    pub fn set_paused(&self, paused: bool) {
        self.ctx.pause.set_user(paused);
        let next = match (paused, self.ctx.state()) {
            (true, ConnectionState::Streaming) => ConnectionState::Paused,
            (false, ConnectionState::Paused) => ConnectionState::Streaming,
            _ => return,
        };
        if let Err(e) = self.ctx.enter(next) {
            debug!(target: "Voice/Client", "Pause state not applied: {e}");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.ctx.pause.is_paused()
    }

    pub fn state(&self) -> ConnectionState {
        self.ctx.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.ctx.subscribe_state()
    }

    pub fn session(&self) -> Arc<VoiceSession> {
        self.ctx.session()
    }

    pub fn heartbeat_latency(&self) -> Option<Duration> {
        self.ctx.heartbeat.latency()
    }

    /// Where the control plane integration publishes its notifications.
    pub fn notifications(&self) -> NotificationHub {
        self.ctx.hub.clone()
    }

    /// Cancelled when the client is disposed.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.ctx.root.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Stops every loop and closes the sockets. Safe to call more than once
    /// and while a recovery is in flight. A faulted client stays faulted.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            debug!(target: "Voice/Client", "Voice client already disposed");
            return;
        }
        info!(target: "Voice/Client", "Disposing voice client");
        self.ctx.root.cancel();
        self.ctx.signaling.shutdown().await;
        self.lock_media_socket().take();
        if let Err(e) = self.ctx.enter(ConnectionState::Disposed) {
            debug!(target: "Voice/Client", "Keeping state {}: {e}", self.ctx.state());
        }
    }
}

impl VoiceClient {
    fn lock_media_socket(&self) -> MutexGuard<'_, Option<Arc<dyn MediaSocket>>> {
        self.media_socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn media_socket(&self) -> Option<Arc<dyn MediaSocket>> {
        self.lock_media_socket().clone()
    }
}

/// The transmitter's view of the client.
struct ClientLink {
    resilience: Arc<ResilienceManager>,
}

#[async_trait]
impl TransmitLink for ClientLink {
    fn session(&self) -> Arc<VoiceSession> {
        self.resilience.context().session()
    }

    fn is_paused(&self) -> bool {
        self.resilience.context().pause.is_paused()
    }

    fn is_faulted(&self) -> bool {
        self.resilience.context().state().is_terminal()
    }

    fn generation(&self) -> u64 {
        self.resilience.generation()
    }

    fn rewind_sequence(&self) {
        self.resilience.context().update_session(|s| s.rewound());
    }

    async fn set_speaking(&self, speaking: bool) -> Result<(), TransportError> {
        let ctx = self.resilience.context();
        let ssrc = ctx
            .session()
            .media
            .as_ref()
            .map(|media| media.ssrc)
            .ok_or(TransportError::NotConnected)?;
        ctx.signaling
            .send(&VoiceMessage::Speaking(Speaking::new(speaking, ssrc)))
            .await
    }

    async fn recover(&self, error: TransportError, generation: u64) -> Result<bool, FatalError> {
        self.resilience.on_transport_lost(error, generation).await
    }
}

/// Reads signaling messages for one connection generation. A receive error
/// is handed to the resilience manager and ends this loop; a successful
/// recovery starts a new one.
pub(crate) async fn receive_loop(
    resilience: Arc<ResilienceManager>,
    generation: u64,
    connection: CancellationToken,
) {
    let ctx = resilience.context().clone();
    debug!(target: "Voice/Client", "Receive loop started for generation {generation}");
    loop {
        let received = tokio::select! {
            biased;
            _ = connection.cancelled() => {
                debug!(target: "Voice/Client", "Receive loop for generation {generation} stopped");
                return;
            }
            received = ctx.signaling.receive() => received,
        };

        match received {
            Ok(Some(message)) => handle_message(&ctx, message),
            Ok(None) => {}
            Err(e) => {
                if connection.is_cancelled() {
                    return;
                }
                warn!(target: "Voice/Client", "Signaling connection lost: {e}");
                match resilience.on_transport_lost(e, generation).await {
                    Ok(true) => {}
                    Ok(false) => error!(target: "Voice/Client", "Voice connection faulted"),
                    Err(e) => debug!(target: "Voice/Client", "Recovery abandoned: {e}"),
                }
                return;
            }
        }
    }
}

fn handle_message(ctx: &VoiceContext, message: VoiceMessage) {
    match message {
        VoiceMessage::HeartbeatAck(nonce) => match ctx.heartbeat.ack(nonce, Utc::now()) {
            Some(rtt) => trace!(target: "Voice/Keepalive", "Heartbeat acked in {} ms", rtt.as_millis()),
            None => debug!(target: "Voice/Keepalive", "Ack for unknown heartbeat {nonce}"),
        },
        VoiceMessage::SessionDescription(description) => {
            let secret_key = match description.secret_key() {
                Ok(key) => key,
                Err(e) => {
                    warn!(target: "Voice/Client", "Ignoring session description: {e}");
                    return;
                }
            };
            let mode = EncryptionMode::from_wire(&description.mode);
            ctx.update_session(|s| match &s.media {
                Some(media) => s.with_media(MediaParams {
                    secret_key,
                    mode: mode.unwrap_or(media.mode),
                    ..media.clone()
                }),
                None => s.clone(),
            });
            info!(target: "Voice/Client", "Session key refreshed");
        }
        VoiceMessage::Hello(hello) => match hello.interval() {
            Ok(interval) => {
                debug!(target: "Voice/Client", "Server hello, interval {} ms", interval.as_millis());
                ctx.update_session(|s| s.with_heartbeat_interval(interval));
            }
            Err(e) => warn!(target: "Voice/Client", "Ignoring hello: {e}"),
        },
        VoiceMessage::Speaking(speaking) => {
            trace!(
                target: "Voice/Client",
                "User {:?} speaking={} on ssrc {}",
                speaking.user_id,
                speaking.is_speaking(),
                speaking.ssrc
            );
        }
        VoiceMessage::Resumed => debug!(target: "Voice/Client", "Session resumed"),
        other => trace!(target: "Voice/Client", "Ignoring {}", other.name()),
    }
}

/// Records a voice server reassignment for our guild so the next resume
/// goes to the new endpoint.
async fn watch_endpoint(
    ctx: Arc<VoiceContext>,
    mut updates: tokio::sync::broadcast::Receiver<voicecore::types::VoiceServerUpdate>,
) {
    loop {
        let update = tokio::select! {
            biased;
            _ = ctx.root.cancelled() => return,
            update = updates.recv() => update,
        };
        match update {
            Ok(update) if ctx.target.matches_server(&update) => {
                let Some(endpoint) = update.endpoint else {
                    continue;
                };
                if ctx.session().endpoint().is_some_and(|current| current != endpoint) {
                    info!(target: "Voice/Client", "Voice endpoint reassigned to {endpoint}");
                    ctx.update_session(|s| s.with_endpoint(endpoint));
                }
            }
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return,
        }
    }
}

pub struct VoiceClientBuilder {
    target: VoiceTarget,
    config: VoiceConfig,
    transport_factory: Option<Arc<dyn TransportFactory>>,
    http_client: Option<Arc<dyn HttpClient>>,
    public_ip: Option<Arc<PublicIpResolver>>,
    control: Option<Arc<dyn ControlPlane>>,
    hub: Option<NotificationHub>,
    status: Option<Arc<dyn StatusChannel>>,
    media_socket: Option<Arc<dyn MediaSocket>>,
}

impl VoiceClientBuilder {
    fn new(target: VoiceTarget) -> Self {
        Self {
            target,
            config: VoiceConfig::default(),
            transport_factory: None,
            http_client: None,
            public_ip: None,
            control: None,
            hub: None,
            status: None,
            media_socket: None,
        }
    }

    pub fn with_config(mut self, config: VoiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to [`TokioWebSocketTransportFactory`].
    pub fn with_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    /// HTTP client for the public address lookup. Defaults to [`UreqHttpClient`].
    ///
    /// Without [`with_public_ip`](Self::with_public_ip) the lookup goes through
    /// [`PublicIpResolver::process_default`], so only the first client built in
    /// the process decides this client and `public_ip_url`.
    pub fn with_http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Overrides the process-wide resolver.
    pub fn with_public_ip(mut self, resolver: Arc<PublicIpResolver>) -> Self {
        self.public_ip = Some(resolver);
        self
    }

    pub fn with_control_plane(mut self, control: Arc<dyn ControlPlane>) -> Self {
        self.control = Some(control);
        self
    }

    /// Share a hub with the control plane integration. A fresh one is
    /// created otherwise, reachable through [`VoiceClient::notifications`].
    pub fn with_notification_hub(mut self, hub: NotificationHub) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn with_status_channel(mut self, status: Arc<dyn StatusChannel>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_media_socket(mut self, socket: Arc<dyn MediaSocket>) -> Self {
        self.media_socket = Some(socket);
        self
    }

    pub fn build(self) -> Result<Arc<VoiceClient>, ClientError> {
        let control = self.control.ok_or(ClientError::Builder("control plane"))?;
        let transport_factory = self
            .transport_factory
            .unwrap_or_else(|| Arc::new(TokioWebSocketTransportFactory::new()));
        let public_ip = self.public_ip.unwrap_or_else(|| {
            let http_client = self
                .http_client
                .unwrap_or_else(|| Arc::new(UreqHttpClient::new()));
            PublicIpResolver::process_default(http_client, self.config.public_ip_url.clone())
        });

        let ctx = Arc::new(VoiceContext::new(
            self.config,
            self.target,
            SignalingChannel::new(transport_factory),
            control,
            self.hub.unwrap_or_default(),
            self.status.unwrap_or_else(|| Arc::new(LogStatusChannel)),
            public_ip,
        ));

        Ok(Arc::new(VoiceClient {
            resilience: ResilienceManager::new(ctx.clone()),
            ctx,
            media_socket: StdMutex::new(self.media_socket),
            transmitting: Mutex::new(()),
            is_connecting: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }))
    }
}
