//! Tokio-based WebSocket transport for the voice signaling channel.
//!
//! Implements [`voicecore::net::Transport`] over `tokio-tungstenite`.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use voicecore::net::{CloseInfo, Transport, TransportEvent, TransportFactory};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

const EVENT_BUFFER: usize = 100;

/// Tokio-based WebSocket transport
pub struct TokioWebSocketTransport {
    ws_sink: Mutex<Option<WsSink>>,
}

impl TokioWebSocketTransport {
    fn new(sink: WsSink) -> Self {
        Self {
            ws_sink: Mutex::new(Some(sink)),
        }
    }
}

#[async_trait]
impl Transport for TokioWebSocketTransport {
    async fn send(&self, text: &str) -> Result<(), anyhow::Error> {
        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Socket is closed"))?;

        trace!("--> Sending text frame: {} bytes", text.len());
        sink.send(Message::text(text.to_owned()))
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket send error: {}", e))?;
        Ok(())
    }

    async fn disconnect(&self) {
        let Some(mut sink) = self.ws_sink.lock().await.take() else {
            return;
        };
        if let Err(e) = sink.close().await {
            debug!("Error while closing websocket: {e}");
        }
    }
}

/// Factory for creating Tokio WebSocket transports
#[derive(Debug, Default, Clone)]
pub struct TokioWebSocketTransportFactory;

impl TokioWebSocketTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for TokioWebSocketTransportFactory {
    async fn create_transport(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        info!("Dialing {url}");
        let (client, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket connect failed: {}", e))?;

        let (sink, stream) = client.split();
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let transport = Arc::new(TokioWebSocketTransport::new(sink));

        let _ = event_tx.send(TransportEvent::Connected).await;
        tokio::task::spawn(read_pump(stream, event_tx));

        Ok((transport, event_rx))
    }
}

fn close_info(frame: Option<CloseFrame>) -> Option<CloseInfo> {
    frame.map(|cf| CloseInfo {
        code: u16::from(cf.code),
        reason: cf.reason.to_string(),
    })
}

async fn read_pump(mut stream: WsStream, event_tx: mpsc::Sender<TransportEvent>) {
    let close = loop {
        let event = match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                trace!("<-- Received text frame: {} bytes", text.len());
                TransportEvent::TextReceived(text.to_string())
            }
            Some(Ok(Message::Binary(data))) => {
                trace!("<-- Received binary frame: {} bytes", data.len());
                TransportEvent::BinaryReceived(Bytes::from(data.to_vec()))
            }
            Some(Ok(Message::Close(frame))) => {
                let info = close_info(frame);
                debug!("Received close frame: {info:?}");
                break info;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                error!("Error reading from websocket: {e}");
                break None;
            }
            None => {
                trace!("Websocket stream ended");
                break None;
            }
        };
        if event_tx.send(event).await.is_err() {
            warn!("Event receiver dropped, closing read pump");
            return;
        }
    };

    let _ = event_tx.send(TransportEvent::Disconnected(close)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::Utf8Bytes;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    #[test]
    fn test_close_frame_keeps_application_code() {
        let info = close_info(Some(CloseFrame {
            code: CloseCode::from(4014),
            reason: Utf8Bytes::from_static("disconnected"),
        }))
        .unwrap();
        assert_eq!(info.code, 4014);
        assert_eq!(info.reason, "disconnected");
        assert!(close_info(None).is_none());
    }
}
