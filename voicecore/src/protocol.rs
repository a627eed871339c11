//! Voice signaling wire format.
//!
//! Every frame is a JSON envelope `{ "op": <opcode>, "d": <payload> }`. Binary
//! frames carry the same envelope zlib-compressed.

use crate::crypto::EncryptionMode;
use crate::types::id::{GuildId, UserId};
use flate2::read::ZlibDecoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Read;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

pub mod opcode {
    pub const IDENTIFY: u8 = 0;
    pub const SELECT_PROTOCOL: u8 = 1;
    pub const READY: u8 = 2;
    pub const HEARTBEAT: u8 = 3;
    pub const SESSION_DESCRIPTION: u8 = 4;
    pub const SPEAKING: u8 = 5;
    pub const HEARTBEAT_ACK: u8 = 6;
    pub const RESUME: u8 = 7;
    pub const HELLO: u8 = 8;
    pub const RESUMED: u8 = 9;
}

/// WebSocket close codes sent by the voice server.
pub mod close_code {
    pub const UNKNOWN_OPCODE: u16 = 4001;
    pub const DECODE_ERROR: u16 = 4002;
    pub const NOT_AUTHENTICATED: u16 = 4003;
    pub const AUTHENTICATION_FAILED: u16 = 4004;
    pub const ALREADY_AUTHENTICATED: u16 = 4005;
    pub const SESSION_NO_LONGER_VALID: u16 = 4006;
    pub const SESSION_TIMEOUT: u16 = 4009;
    pub const SERVER_NOT_FOUND: u16 = 4011;
    pub const UNKNOWN_PROTOCOL: u16 = 4012;
    /// Channel deleted, bot kicked, or the voice server changed.
    pub const DISCONNECTED: u16 = 4014;
    pub const VOICE_SERVER_CRASHED: u16 = 4015;
    pub const UNKNOWN_ENCRYPTION_MODE: u16 = 4016;

    pub fn classify(code: Option<u16>) -> super::LossKind {
        super::LossKind::from_close_code(code)
    }
}

/// How a lost signaling connection must be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossKind {
    /// Retry with a resume first.
    Transient,
    /// The voice server was changed or we were disconnected from it.
    ServerChanged,
    /// The server no longer knows our session.
    SessionInvalid,
}

impl LossKind {
    pub fn from_close_code(code: Option<u16>) -> Self {
        match code {
            Some(close_code::DISCONNECTED) => LossKind::ServerChanged,
            Some(close_code::SESSION_NO_LONGER_VALID) => LossKind::SessionInvalid,
            _ => LossKind::Transient,
        }
    }

    /// Fatal losses cannot be resumed and need a full reconnect.
    pub fn is_fatal(self) -> bool {
        !matches!(self, LossKind::Transient)
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed signaling payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to inflate compressed frame: {0}")]
    Decompress(#[from] std::io::Error),
    #[error("required field `{0}` is empty")]
    EmptyField(&'static str),
    #[error("invalid value for `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identify {
    pub server_id: GuildId,
    pub user_id: UserId,
    pub session_id: String,
    pub token: String,
}

impl Identify {
    pub fn new(
        server_id: GuildId,
        user_id: UserId,
        session_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<Self> {
        let session_id = non_empty("session_id", session_id.into())?;
        let token = non_empty("token", token.into())?;
        if server_id.get() == 0 {
            return Err(ProtocolError::EmptyField("server_id"));
        }
        if user_id.get() == 0 {
            return Err(ProtocolError::EmptyField("user_id"));
        }
        Ok(Self {
            server_id,
            user_id,
            session_id,
            token,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectProtocolData {
    pub address: String,
    pub port: u16,
    pub mode: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectProtocol {
    pub protocol: String,
    pub data: SelectProtocolData,
}

impl SelectProtocol {
    pub fn udp(address: IpAddr, port: u16, mode: EncryptionMode) -> Self {
        Self {
            protocol: "udp".to_string(),
            data: SelectProtocolData {
                address: address.to_string(),
                port,
                mode: mode.as_str().to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ready {
    pub ssrc: u32,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub modes: Vec<String>,
}

impl Ready {
    pub fn ip_addr(&self) -> Result<IpAddr> {
        self.ip.parse().map_err(|e| ProtocolError::InvalidField {
            field: "ip",
            reason: format!("{e}"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(default)]
    pub mode: String,
    pub secret_key: Vec<u8>,
}

impl SessionDescription {
    pub fn secret_key(&self) -> Result<[u8; crate::crypto::KEY_SIZE]> {
        self.secret_key
            .as_slice()
            .try_into()
            .map_err(|_| ProtocolError::InvalidField {
                field: "secret_key",
                reason: format!(
                    "expected {} bytes, got {}",
                    crate::crypto::KEY_SIZE,
                    self.secret_key.len()
                ),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Speaking {
    /// Bit flags; bit 0 is "microphone".
    pub speaking: u8,
    #[serde(default)]
    pub delay: u32,
    pub ssrc: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

impl Speaking {
    pub const MICROPHONE: u8 = 1;

    pub fn new(speaking: bool, ssrc: u32) -> Self {
        Self {
            speaking: if speaking { Self::MICROPHONE } else { 0 },
            delay: 0,
            ssrc,
            user_id: None,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resume {
    pub server_id: GuildId,
    pub session_id: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    /// Milliseconds. Some servers send this as a float.
    pub heartbeat_interval: f64,
}

impl Hello {
    pub fn from_duration(interval: Duration) -> Self {
        Self {
            heartbeat_interval: interval.as_millis() as f64,
        }
    }

    pub fn interval(&self) -> Result<Duration> {
        let ms = self.heartbeat_interval;
        if !ms.is_finite() || ms <= 0.0 {
            return Err(ProtocolError::InvalidField {
                field: "heartbeat_interval",
                reason: format!("{ms} is not a positive interval"),
            });
        }
        Duration::try_from_secs_f64(ms / 1000.0).map_err(|e| ProtocolError::InvalidField {
            field: "heartbeat_interval",
            reason: format!("{ms}: {e}"),
        })
    }
}

/// A decoded signaling message.
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceMessage {
    Identify(Identify),
    SelectProtocol(SelectProtocol),
    Ready(Ready),
    Heartbeat(u64),
    SessionDescription(SessionDescription),
    Speaking(Speaking),
    HeartbeatAck(u64),
    Resume(Resume),
    Hello(Hello),
    Resumed,
}

impl VoiceMessage {
    pub fn opcode(&self) -> u8 {
        match self {
            VoiceMessage::Identify(_) => opcode::IDENTIFY,
            VoiceMessage::SelectProtocol(_) => opcode::SELECT_PROTOCOL,
            VoiceMessage::Ready(_) => opcode::READY,
            VoiceMessage::Heartbeat(_) => opcode::HEARTBEAT,
            VoiceMessage::SessionDescription(_) => opcode::SESSION_DESCRIPTION,
            VoiceMessage::Speaking(_) => opcode::SPEAKING,
            VoiceMessage::HeartbeatAck(_) => opcode::HEARTBEAT_ACK,
            VoiceMessage::Resume(_) => opcode::RESUME,
            VoiceMessage::Hello(_) => opcode::HELLO,
            VoiceMessage::Resumed => opcode::RESUMED,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            VoiceMessage::Identify(_) => "Identify",
            VoiceMessage::SelectProtocol(_) => "SelectProtocol",
            VoiceMessage::Ready(_) => "Ready",
            VoiceMessage::Heartbeat(_) => "Heartbeat",
            VoiceMessage::SessionDescription(_) => "SessionDescription",
            VoiceMessage::Speaking(_) => "Speaking",
            VoiceMessage::HeartbeatAck(_) => "HeartbeatAck",
            VoiceMessage::Resume(_) => "Resume",
            VoiceMessage::Hello(_) => "Hello",
            VoiceMessage::Resumed => "Resumed",
        }
    }
}

#[derive(Serialize)]
struct OutgoingEnvelope {
    op: u8,
    d: Value,
}

#[derive(Deserialize)]
struct IncomingEnvelope {
    op: u64,
    #[serde(default)]
    d: Value,
}

/// Serializes a message into its JSON envelope.
pub fn encode(message: &VoiceMessage) -> Result<String> {
    let d = match message {
        VoiceMessage::Identify(p) => serde_json::to_value(p)?,
        VoiceMessage::SelectProtocol(p) => serde_json::to_value(p)?,
        VoiceMessage::Ready(p) => serde_json::to_value(p)?,
        VoiceMessage::Heartbeat(nonce) | VoiceMessage::HeartbeatAck(nonce) => Value::from(*nonce),
        VoiceMessage::SessionDescription(p) => serde_json::to_value(p)?,
        VoiceMessage::Speaking(p) => serde_json::to_value(p)?,
        VoiceMessage::Resume(p) => serde_json::to_value(p)?,
        VoiceMessage::Hello(p) => serde_json::to_value(p)?,
        VoiceMessage::Resumed => Value::Null,
    };
    let envelope = OutgoingEnvelope {
        op: message.opcode(),
        d,
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Parses a text frame. Unknown opcodes yield `Ok(None)`.
pub fn decode_text(text: &str) -> Result<Option<VoiceMessage>> {
    let envelope: IncomingEnvelope = serde_json::from_str(text)?;
    let Ok(op) = u8::try_from(envelope.op) else {
        return Ok(None);
    };
    let d = envelope.d;
    let message = match op {
        opcode::IDENTIFY => VoiceMessage::Identify(serde_json::from_value(d)?),
        opcode::SELECT_PROTOCOL => VoiceMessage::SelectProtocol(serde_json::from_value(d)?),
        opcode::READY => VoiceMessage::Ready(serde_json::from_value(d)?),
        opcode::HEARTBEAT => VoiceMessage::Heartbeat(parse_nonce("d", &d)?),
        opcode::SESSION_DESCRIPTION => {
            VoiceMessage::SessionDescription(serde_json::from_value(d)?)
        }
        opcode::SPEAKING => VoiceMessage::Speaking(serde_json::from_value(d)?),
        opcode::HEARTBEAT_ACK => VoiceMessage::HeartbeatAck(parse_nonce("d", &d)?),
        opcode::RESUME => VoiceMessage::Resume(serde_json::from_value(d)?),
        opcode::HELLO => VoiceMessage::Hello(serde_json::from_value(d)?),
        opcode::RESUMED => VoiceMessage::Resumed,
        _ => return Ok(None),
    };
    Ok(Some(message))
}

/// Inflates a zlib-compressed binary frame and parses it.
pub fn decode_binary(data: &[u8]) -> Result<Option<VoiceMessage>> {
    let mut text = String::new();
    ZlibDecoder::new(data).read_to_string(&mut text)?;
    decode_text(&text)
}

/// Heartbeat nonces arrive as a number, a numeric string, or `{ "t": n }`.
fn parse_nonce(field: &'static str, value: &Value) -> Result<u64> {
    let nonce = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        Value::Object(map) => map.get("t").and_then(Value::as_u64),
        _ => None,
    };
    nonce.ok_or_else(|| ProtocolError::InvalidField {
        field,
        reason: format!("not a heartbeat nonce: {value}"),
    })
}

fn non_empty(field: &'static str, value: String) -> Result<String> {
    if value.trim().is_empty() {
        Err(ProtocolError::EmptyField(field))
    } else {
        Ok(value)
    }
}

/// Builds the signaling URL for an endpoint handed out by the control plane.
pub fn signaling_url(endpoint: &str, gateway_version: u8) -> String {
    let host = endpoint
        .trim_start_matches("wss://")
        .trim_start_matches("ws://")
        .trim_end_matches('/');
    format!("wss://{host}?v={gateway_version}")
}
