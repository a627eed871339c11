//! The voice signaling WebSocket.
//!
//! Owns at most one transport at a time. Receive errors come back tagged with
//! the close code so the caller can classify the loss; nothing here retries.

use crate::error::TransportError;
use log::{debug, info, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use voicecore::net::{Transport, TransportEvent, TransportFactory};
use voicecore::protocol::{self, VoiceMessage};

type Result<T> = std::result::Result<T, TransportError>;

pub struct SignalingChannel {
    factory: Arc<dyn TransportFactory>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    events: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    /// Cancelled on close so a pending `receive` lets go of `events`.
    socket_token: std::sync::Mutex<CancellationToken>,
    shut_down: AtomicBool,
}

impl SignalingChannel {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            transport: Mutex::new(None),
            events: Mutex::new(None),
            socket_token: std::sync::Mutex::new(CancellationToken::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Opens a socket to `url`, closing any previous one first.
    pub async fn connect(&self, url: &str) -> Result<()> {
        if self.is_shut_down() {
            return Err(TransportError::ShutDown);
        }
        self.close().await;

        info!(target: "Voice/Signaling", "Connecting to {url}");
        let (transport, events) = self
            .factory
            .create_transport(url)
            .await
            .map_err(TransportError::Connect)?;

        // Shut down while we were dialing.
        if self.is_shut_down() {
            transport.disconnect().await;
            return Err(TransportError::ShutDown);
        }

        let mut events_guard = self.events.lock().await;
        *self.transport.lock().await = Some(transport);
        *events_guard = Some(events);
        *self
            .socket_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = CancellationToken::new();
        Ok(())
    }

    pub async fn send(&self, message: &VoiceMessage) -> Result<()> {
        let text = protocol::encode(message)?;
        let transport = self
            .transport
            .lock()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)?;
        trace!(target: "Voice/Signaling", "--> {}", message.name());
        transport.send(&text).await.map_err(TransportError::Send)
    }

    /// Next message. `Ok(None)` for frames that must be ignored: malformed
    /// payloads and unknown opcodes.
    pub async fn receive(&self) -> Result<Option<VoiceMessage>> {
        let mut events_guard = self.events.lock().await;
        let token = self.current_socket_token();
        let events = events_guard.as_mut().ok_or(TransportError::NotConnected)?;

        loop {
            let event = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(TransportError::Closed { code: None }),
                event = events.recv() => event,
            };

            let decoded = match event {
                Some(TransportEvent::Connected) => continue,
                Some(TransportEvent::TextReceived(text)) => protocol::decode_text(&text),
                Some(TransportEvent::BinaryReceived(data)) => protocol::decode_binary(&data),
                Some(TransportEvent::Disconnected(close)) => {
                    let code = close.map(|info| {
                        debug!(
                            target: "Voice/Signaling",
                            "Server closed socket: {} {}", info.code, info.reason
                        );
                        info.code
                    });
                    return Err(TransportError::Closed { code });
                }
                None => return Err(TransportError::Closed { code: None }),
            };

            return match decoded {
                Ok(Some(message)) => {
                    trace!(target: "Voice/Signaling", "<-- {}", message.name());
                    Ok(Some(message))
                }
                Ok(None) => {
                    trace!(target: "Voice/Signaling", "<-- unknown opcode, ignored");
                    Ok(None)
                }
                Err(e) => {
                    warn!(target: "Voice/Signaling", "Ignoring malformed frame: {e}");
                    Ok(None)
                }
            };
        }
    }

    /// Closes the current socket. Returns whether there was one to close.
    pub async fn close(&self) -> bool {
        self.current_socket_token().cancel();
        let transport = self.transport.lock().await.take();
        self.events.lock().await.take();
        match transport {
            Some(transport) => {
                debug!(target: "Voice/Signaling", "Closing signaling socket");
                transport.disconnect().await;
                true
            }
            None => false,
        }
    }

    /// Closes the socket and refuses any later `connect`.
    pub async fn shutdown(&self) -> bool {
        self.shut_down.store(true, Ordering::SeqCst);
        self.close().await
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub async fn is_connected(&self) -> bool {
        self.transport.lock().await.is_some()
    }

    fn current_socket_token(&self) -> CancellationToken {
        self.socket_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
