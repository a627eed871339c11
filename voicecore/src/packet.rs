//! Media packet framing.
//!
//! A packet is a fixed 12-byte RTP-style header followed by the sealed frame.
//! The nonce is the header padded with zeros to 24 bytes, so a header must
//! never repeat under the same key.

use crate::crypto::{self, CryptoError, NONCE_SIZE};
use crate::session::VoiceSession;
use thiserror::Error;

pub const HEADER_SIZE: usize = 12;
/// Version 2, no padding/extension/CSRC.
pub const HEADER_FLAGS: u8 = 0x80;
/// Payload type used for voice frames.
pub const PAYLOAD_TYPE: u8 = 0x78;
/// 20 ms of audio at 48 kHz.
pub const SAMPLES_PER_FRAME: u32 = 960;

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("session has no media parameters")]
    MissingMedia,
    #[error("packet too short: {0} bytes")]
    Truncated(usize),
    #[error("unexpected header bytes {0:#04x} {1:#04x}")]
    BadHeader(u8, u8),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl PacketHeader {
    /// Header for the `frame_index`-th frame given the session's offset.
    pub fn for_frame(
        frame_index: i64,
        sequence_offset: i32,
        samples_per_frame: u32,
        ssrc: u32,
    ) -> Self {
        let n = frame_index.wrapping_sub(i64::from(sequence_offset));
        Self {
            sequence: n.rem_euclid(1 << 16) as u16,
            timestamp: n.wrapping_mul(i64::from(samples_per_frame)) as u32,
            ssrc,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = HEADER_FLAGS;
        buf[1] = PAYLOAD_TYPE;
        buf[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        buf
    }

    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < HEADER_SIZE {
            return Err(PacketError::Truncated(data.len()));
        }
        if data[0] != HEADER_FLAGS || data[1] != PAYLOAD_TYPE {
            return Err(PacketError::BadHeader(data[0], data[1]));
        }
        Ok(Self {
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        })
    }

    pub fn nonce(&self) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..HEADER_SIZE].copy_from_slice(&self.encode());
        nonce
    }
}

/// Frames and seals one audio frame with the default 960 samples per frame.
pub fn build_packet(
    session: &VoiceSession,
    frame: &[u8],
    frame_index: i64,
) -> Result<Vec<u8>, PacketError> {
    build_packet_with(session, frame, frame_index, SAMPLES_PER_FRAME)
}

pub fn build_packet_with(
    session: &VoiceSession,
    frame: &[u8],
    frame_index: i64,
    samples_per_frame: u32,
) -> Result<Vec<u8>, PacketError> {
    let media = session.media.as_ref().ok_or(PacketError::MissingMedia)?;
    let header = PacketHeader::for_frame(
        frame_index,
        session.sequence_offset,
        samples_per_frame,
        media.ssrc,
    );
    let sealed = crypto::secretbox::encrypt(&media.secret_key, &header.nonce(), frame)?;

    let mut packet = Vec::with_capacity(HEADER_SIZE + sealed.len());
    packet.extend_from_slice(&header.encode());
    packet.extend_from_slice(&sealed);
    Ok(packet)
}

/// Opens a packet built by [`build_packet`].
pub fn decrypt_packet(
    secret_key: &[u8],
    packet: &[u8],
) -> Result<(PacketHeader, Vec<u8>), PacketError> {
    let header = PacketHeader::parse(packet)?;
    let frame = crypto::secretbox::decrypt(secret_key, &header.nonce(), &packet[HEADER_SIZE..])?;
    Ok((header, frame))
}
