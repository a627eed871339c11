use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::client::VoiceClient;
use crate::config::VoiceConfig;
use crate::context::VoiceContext;
use crate::control::{ControlPlane, NotificationHub};
use crate::error::{FatalError, TransportError};
use crate::public_ip::PublicIpResolver;
use crate::signaling::SignalingChannel;
use crate::status::{StatusChannel, StatusNotice};
use crate::transmit::TransmitLink;
use crate::udp::MediaSocket;
use voicecore::crypto::{EncryptionMode, KEY_SIZE};
use voicecore::net::{
    CloseInfo, HttpClient, HttpRequest, HttpResponse, Transport, TransportEvent, TransportFactory,
};
use voicecore::protocol::{self, Hello, Ready, SessionDescription, VoiceMessage};
use voicecore::session::{MediaParams, SessionCredentials, VoiceSession};
use voicecore::types::{ChannelId, GuildId, UserId, VoiceServerUpdate, VoiceStateUpdate, VoiceTarget};

pub const TEST_SSRC: u32 = 42;
pub const TEST_KEY: [u8; KEY_SIZE] = [7; KEY_SIZE];
pub const TEST_ENDPOINT: &str = "voice.test:443";

pub fn test_target() -> VoiceTarget {
    VoiceTarget::new(GuildId(1), ChannelId(2), UserId(3))
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

#[derive(Debug, Clone, PartialEq)]
pub enum WireEvent {
    Connect(String),
    Send(VoiceMessage),
    Disconnect,
}

#[derive(Debug, Clone)]
struct ServerScript {
    modes: Vec<String>,
    withhold_session_description: bool,
    refuse_resume: bool,
}

impl Default for ServerScript {
    fn default() -> Self {
        Self {
            modes: vec![
                "aead_aes256_gcm_rtpsize".to_string(),
                EncryptionMode::XSalsa20Poly1305.as_str().to_string(),
            ],
            withhold_session_description: false,
            refuse_resume: false,
        }
    }
}

struct Wire {
    script: ServerScript,
    log: Mutex<Vec<WireEvent>>,
    current: Mutex<Option<Arc<ScriptedTransport>>>,
}

/// A fake voice server behind the transport seam. It answers the client's
/// messages the way the real one does and records everything on the wire.
pub struct ScriptedTransportFactory {
    wire: Arc<Wire>,
    failing_connects: AtomicUsize,
    connects: AtomicUsize,
}

impl ScriptedTransportFactory {
    pub fn new() -> Self {
        Self::with_script(ServerScript::default())
    }

    fn with_script(script: ServerScript) -> Self {
        Self {
            wire: Arc::new(Wire {
                script,
                log: Mutex::new(Vec::new()),
                current: Mutex::new(None),
            }),
            failing_connects: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn log(&self) -> Vec<WireEvent> {
        lock(&self.wire.log).clone()
    }

    pub fn clear_log(&self) {
        lock(&self.wire.log).clear();
    }

    /// Messages the client sent, heartbeats excluded.
    pub fn sent(&self) -> Vec<VoiceMessage> {
        self.log()
            .into_iter()
            .filter_map(|event| match event {
                WireEvent::Send(VoiceMessage::Heartbeat(_)) => None,
                WireEvent::Send(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn sent_names(&self) -> Vec<&'static str> {
        self.sent().iter().map(VoiceMessage::name).collect()
    }

    /// Successful socket opens since creation.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.log()
            .iter()
            .filter(|event| matches!(event, WireEvent::Disconnect))
            .count()
    }

    pub fn inject_text(&self, text: &str) {
        if let Some(transport) = lock(&self.wire.current).as_ref() {
            transport.push(TransportEvent::TextReceived(text.to_string()));
        }
    }

    /// The server drops the current socket, with a close code if given.
    pub fn drop_connection(&self, code: Option<u16>) {
        if let Some(transport) = lock(&self.wire.current).take() {
            transport.server_closed.store(true, Ordering::SeqCst);
            transport.push(TransportEvent::Disconnected(code.map(|code| CloseInfo {
                code,
                reason: "scripted close".to_string(),
            })));
        }
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransportFactory for ScriptedTransportFactory {
    async fn create_transport(
        &self,
        url: &str,
    ) -> anyhow::Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>)> {
        let failing = self
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("scripted connect failure to {url}");
        }

        let (tx, rx) = mpsc::channel(64);
        let transport = Arc::new(ScriptedTransport {
            wire: self.wire.clone(),
            events: tx,
            disconnected: AtomicBool::new(false),
            server_closed: AtomicBool::new(false),
        });
        lock(&self.wire.log).push(WireEvent::Connect(url.to_string()));
        self.connects.fetch_add(1, Ordering::SeqCst);
        transport.push(TransportEvent::Connected);
        transport.reply(VoiceMessage::Hello(Hello::from_duration(Duration::from_millis(
            5000,
        ))));
        *lock(&self.wire.current) = Some(transport.clone());
        Ok((transport, rx))
    }
}

struct ScriptedTransport {
    wire: Arc<Wire>,
    events: mpsc::Sender<TransportEvent>,
    disconnected: AtomicBool,
    server_closed: AtomicBool,
}

impl ScriptedTransport {
    fn push(&self, event: TransportEvent) {
        let _ = self.events.try_send(event);
    }

    fn reply(&self, message: VoiceMessage) {
        let text = protocol::encode(&message).unwrap();
        self.push(TransportEvent::TextReceived(text));
    }

    fn answer(&self, message: &VoiceMessage) {
        let script = &self.wire.script;
        match message {
            VoiceMessage::Identify(_) => self.reply(VoiceMessage::Ready(Ready {
                ssrc: TEST_SSRC,
                ip: "1.2.3.4".to_string(),
                port: 5000,
                modes: script.modes.clone(),
            })),
            VoiceMessage::SelectProtocol(select) if !script.withhold_session_description => {
                self.reply(VoiceMessage::SessionDescription(SessionDescription {
                    mode: select.data.mode.clone(),
                    secret_key: TEST_KEY.to_vec(),
                }))
            }
            VoiceMessage::Resume(_) if script.refuse_resume => {
                self.server_closed.store(true, Ordering::SeqCst);
                self.push(TransportEvent::Disconnected(Some(CloseInfo {
                    code: 4006,
                    reason: "Session is no longer valid".to_string(),
                })));
            }
            VoiceMessage::Resume(_) => self.reply(VoiceMessage::Resumed),
            VoiceMessage::Heartbeat(nonce) => self.reply(VoiceMessage::HeartbeatAck(*nonce)),
            _ => {}
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, text: &str) -> anyhow::Result<()> {
        if self.disconnected.load(Ordering::SeqCst) || self.server_closed.load(Ordering::SeqCst) {
            anyhow::bail!("socket is closed");
        }
        let message = protocol::decode_text(text)?
            .ok_or_else(|| anyhow::anyhow!("client sent an unknown opcode"))?;
        lock(&self.wire.log).push(WireEvent::Send(message.clone()));
        self.answer(&message);
        Ok(())
    }

    async fn disconnect(&self) {
        if !self.disconnected.swap(true, Ordering::SeqCst) {
            lock(&self.wire.log).push(WireEvent::Disconnect);
        }
    }
}

/// Answers the join intent with the two notifications, surrounded by
/// updates meant for someone else.
pub struct ScriptedControlPlane {
    hub: NotificationHub,
    target: VoiceTarget,
    silent: bool,
    joins: AtomicUsize,
}

impl ScriptedControlPlane {
    pub fn new(hub: NotificationHub, target: VoiceTarget) -> Self {
        Self {
            hub,
            target,
            silent: false,
            joins: AtomicUsize::new(0),
        }
    }

    /// Records the join but never answers it.
    pub fn silent(hub: NotificationHub, target: VoiceTarget) -> Self {
        Self {
            silent: true,
            ..Self::new(hub, target)
        }
    }

    pub fn joins(&self) -> usize {
        self.joins.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ControlPlane for ScriptedControlPlane {
    async fn request_join(&self, target: &VoiceTarget) -> anyhow::Result<()> {
        self.joins.fetch_add(1, Ordering::SeqCst);
        if self.silent {
            return Ok(());
        }
        let hub = &self.hub;
        let target = *target;
        hub.publish_voice_state(VoiceStateUpdate {
            guild_id: target.guild_id,
            channel_id: Some(target.channel_id),
            user_id: UserId(target.user_id.get() + 1),
            session_id: "someone-else".to_string(),
        });
        hub.publish_voice_server(VoiceServerUpdate {
            guild_id: GuildId(target.guild_id.get() + 1),
            token: "other-token".to_string(),
            endpoint: Some("other.voice.test".to_string()),
        });
        hub.publish_voice_server(VoiceServerUpdate {
            guild_id: target.guild_id,
            token: "token-1".to_string(),
            endpoint: Some(TEST_ENDPOINT.to_string()),
        });
        hub.publish_voice_state(VoiceStateUpdate {
            guild_id: self.target.guild_id,
            channel_id: Some(self.target.channel_id),
            user_id: self.target.user_id,
            session_id: "session-1".to_string(),
        });
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingStatusChannel {
    notices: Mutex<Vec<StatusNotice>>,
}

impl RecordingStatusChannel {
    pub fn notices(&self) -> Vec<StatusNotice> {
        lock(&self.notices).clone()
    }
}

impl StatusChannel for RecordingStatusChannel {
    fn notify(&self, notice: &StatusNotice) {
        lock(&self.notices).push(notice.clone());
    }
}

#[derive(Debug)]
pub struct MockHttpClient {
    status_code: u16,
    body: String,
    requests: Mutex<Vec<String>>,
}

impl MockHttpClient {
    pub fn with_body(status_code: u16, body: &str) -> Self {
        Self {
            status_code,
            body: body.to_string(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<String> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn execute(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
        lock(&self.requests).push(request.url);
        Ok(HttpResponse {
            status_code: self.status_code,
            body: self.body.clone().into_bytes(),
        })
    }
}

/// Records every datagram; attempts at the given indices fail.
#[derive(Debug, Default)]
pub struct RecordingMediaSocket {
    attempts: Mutex<Vec<Vec<u8>>>,
    sent_at: Mutex<Vec<Instant>>,
    failing: HashSet<usize>,
}

impl RecordingMediaSocket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(attempts: &[usize]) -> Self {
        Self {
            failing: attempts.iter().copied().collect(),
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> Vec<Vec<u8>> {
        lock(&self.attempts).clone()
    }

    /// Milliseconds between consecutive attempts, failed ones included.
    pub fn gaps_ms(&self) -> Vec<u128> {
        lock(&self.sent_at)
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).as_millis())
            .collect()
    }

    /// Time from the first attempt to the last.
    pub fn span(&self) -> Duration {
        let sent_at = lock(&self.sent_at);
        match (sent_at.first(), sent_at.last()) {
            (Some(first), Some(last)) => *last - *first,
            _ => Duration::ZERO,
        }
    }

    pub fn delivered(&self) -> Vec<Vec<u8>> {
        self.attempts()
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !self.failing.contains(i))
            .map(|(_, packet)| packet)
            .collect()
    }
}

#[async_trait]
impl MediaSocket for RecordingMediaSocket {
    async fn send_to(&self, packet: &[u8], _target: SocketAddr) -> io::Result<usize> {
        let mut attempts = lock(&self.attempts);
        let index = attempts.len();
        attempts.push(packet.to_vec());
        lock(&self.sent_at).push(Instant::now());
        if self.failing.contains(&index) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "scripted send failure",
            ));
        }
        Ok(packet.len())
    }
}

pub fn test_media() -> MediaParams {
    MediaParams {
        ssrc: TEST_SSRC,
        target: "127.0.0.1:5000".parse().unwrap(),
        secret_key: TEST_KEY,
        mode: EncryptionMode::XSalsa20Poly1305,
    }
}

/// A transmit link with no connection behind it.
pub struct StubLink {
    session: Mutex<Arc<VoiceSession>>,
    paused: AtomicBool,
    faulted: AtomicBool,
    recovers: bool,
    recovery_delay: Duration,
    recoveries: AtomicUsize,
    speaking: Mutex<Vec<bool>>,
    pause_trigger: Mutex<Option<(Arc<RecordingMediaSocket>, usize)>>,
}

impl StubLink {
    fn with_session(session: VoiceSession) -> Self {
        Self {
            session: Mutex::new(Arc::new(session)),
            paused: AtomicBool::new(false),
            faulted: AtomicBool::new(false),
            recovers: true,
            recovery_delay: Duration::ZERO,
            recoveries: AtomicUsize::new(0),
            speaking: Mutex::new(Vec::new()),
            pause_trigger: Mutex::new(None),
        }
    }

    pub fn streaming() -> Self {
        Self::with_session(VoiceSession::empty().with_media(test_media()))
    }

    pub fn without_media() -> Self {
        Self::with_session(VoiceSession::empty())
    }

    pub fn with_recovery(mut self, recovers: bool) -> Self {
        self.recovers = recovers;
        self
    }

    /// Recovery pauses the link for `delay` before it reports back.
    pub fn with_recovery_delay(mut self, delay: Duration) -> Self {
        self.recovery_delay = delay;
        self
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn set_faulted(&self, faulted: bool) {
        self.faulted.store(faulted, Ordering::SeqCst);
    }

    /// Pauses once `socket` has seen `packets` attempts.
    pub fn pause_after_packets(&self, socket: &Arc<RecordingMediaSocket>, packets: usize) {
        *lock(&self.pause_trigger) = Some((socket.clone(), packets));
    }

    pub fn speaking_log(&self) -> Vec<bool> {
        lock(&self.speaking).clone()
    }

    pub fn recoveries(&self) -> usize {
        self.recoveries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransmitLink for StubLink {
    fn session(&self) -> Arc<VoiceSession> {
        lock(&self.session).clone()
    }

    fn is_paused(&self) -> bool {
        let mut trigger = lock(&self.pause_trigger);
        let reached = trigger
            .as_ref()
            .is_some_and(|(socket, packets)| socket.attempts().len() >= *packets);
        if reached {
            trigger.take();
            self.set_paused(true);
        }
        self.paused.load(Ordering::SeqCst)
    }

    fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }

    fn generation(&self) -> u64 {
        self.recoveries() as u64 + 1
    }

    fn rewind_sequence(&self) {
        let mut session = lock(&self.session);
        *session = Arc::new(session.rewound());
    }

    async fn set_speaking(&self, speaking: bool) -> Result<(), TransportError> {
        lock(&self.speaking).push(speaking);
        Ok(())
    }

    async fn recover(&self, _error: TransportError, _generation: u64) -> Result<bool, FatalError> {
        self.recoveries.fetch_add(1, Ordering::SeqCst);
        if !self.recovery_delay.is_zero() {
            self.set_paused(true);
            tokio::time::sleep(self.recovery_delay).await;
            self.set_paused(false);
        }
        Ok(self.recovers)
    }
}

/// Fakes for every seam of a voice client, wired to a fast configuration.
pub struct TestRig {
    pub transport: Arc<ScriptedTransportFactory>,
    pub control: Arc<ScriptedControlPlane>,
    pub status: Arc<RecordingStatusChannel>,
    pub socket: Arc<RecordingMediaSocket>,
    pub hub: NotificationHub,
    pub config: VoiceConfig,
    pub target: VoiceTarget,
    context: OnceLock<Arc<VoiceContext>>,
}

impl TestRig {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> TestRigBuilder {
        TestRigBuilder::default()
    }

    /// A shared context for driving the internals directly. Built on first use.
    pub fn context(&self) -> Arc<VoiceContext> {
        self.context
            .get_or_init(|| {
                Arc::new(VoiceContext::new(
                    self.config.clone(),
                    self.target,
                    SignalingChannel::new(self.transport.clone()),
                    self.control.clone(),
                    self.hub.clone(),
                    self.status.clone(),
                    fixed_public_ip(),
                ))
            })
            .clone()
    }

    /// A full client over the same fakes. Do not mix with [`context`](Self::context).
    pub fn client(&self) -> Arc<VoiceClient> {
        VoiceClient::builder(self.target)
            .with_config(self.config.clone())
            .with_transport_factory(self.transport.clone())
            .with_control_plane(self.control.clone())
            .with_notification_hub(self.hub.clone())
            .with_status_channel(self.status.clone())
            .with_public_ip(fixed_public_ip())
            .with_media_socket(self.socket.clone())
            .build()
            .unwrap()
    }

    pub fn credentials(&self) -> SessionCredentials {
        SessionCredentials {
            session_id: "session-1".to_string(),
            token: "token-1".to_string(),
            endpoint: TEST_ENDPOINT.to_string(),
        }
    }
}

fn fixed_public_ip() -> Arc<PublicIpResolver> {
    Arc::new(PublicIpResolver::with_fixed("127.0.0.1".parse().unwrap()))
}

#[derive(Default)]
pub struct TestRigBuilder {
    script: ServerScript,
    silent_control_plane: bool,
    join_timeout_ms: Option<u64>,
    handshake_timeout_ms: Option<u64>,
    failing_sends: Vec<usize>,
    config: Option<VoiceConfig>,
}

impl TestRigBuilder {
    pub fn silent_control_plane(mut self) -> Self {
        self.silent_control_plane = true;
        self
    }

    pub fn join_timeout_ms(mut self, ms: u64) -> Self {
        self.join_timeout_ms = Some(ms);
        self
    }

    pub fn handshake_timeout_ms(mut self, ms: u64) -> Self {
        self.handshake_timeout_ms = Some(ms);
        self
    }

    pub fn modes(mut self, modes: &[&str]) -> Self {
        self.script.modes = modes.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn withhold_session_description(mut self) -> Self {
        self.script.withhold_session_description = true;
        self
    }

    pub fn refuse_resume(mut self) -> Self {
        self.script.refuse_resume = true;
        self
    }

    /// Media sends at these attempt indices fail.
    pub fn failing_sends(mut self, attempts: &[usize]) -> Self {
        self.failing_sends = attempts.to_vec();
        self
    }

    pub fn config(mut self, config: VoiceConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> TestRig {
        let target = test_target();
        let hub = NotificationHub::new();
        let control = if self.silent_control_plane {
            ScriptedControlPlane::silent(hub.clone(), target)
        } else {
            ScriptedControlPlane::new(hub.clone(), target)
        };

        let mut config = self.config.unwrap_or_else(|| VoiceConfig {
            frame_duration_ms: 2,
            batch_wait_ms: 1,
            handshake_timeout_ms: 2_000,
            join_timeout_ms: 2_000,
            resume_timeout_ms: 2_000,
            ..VoiceConfig::default()
        });
        if let Some(ms) = self.join_timeout_ms {
            config.join_timeout_ms = ms;
        }
        if let Some(ms) = self.handshake_timeout_ms {
            config.handshake_timeout_ms = ms;
        }

        TestRig {
            transport: Arc::new(ScriptedTransportFactory::with_script(self.script)),
            control: Arc::new(control),
            status: Arc::new(RecordingStatusChannel::default()),
            socket: Arc::new(RecordingMediaSocket::failing_on(&self.failing_sends)),
            hub,
            config,
            target,
            context: OnceLock::new(),
        }
    }
}

/// Polls `condition` until it holds or a second passes.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    condition()
}
