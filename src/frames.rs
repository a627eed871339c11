//! Length-prefixed frame files: each frame is a big-endian `u16` length
//! followed by that many bytes of encoded audio.

use crate::config::SilencePreamble;
use std::io::{self, Read, Write};
use std::path::Path;

/// An Opus frame of digital silence.
pub const SILENCE_FRAME: [u8; 3] = [0xF8, 0xFF, 0xFE];
pub const SILENCE_FRAME_COUNT: usize = 5;

pub fn read_frames<R: Read>(mut reader: R) -> io::Result<Vec<Vec<u8>>> {
    let mut frames = Vec::new();
    loop {
        let mut len = [0u8; 2];
        match reader.read_exact(&mut len) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        let mut frame = vec![0u8; u16::from_be_bytes(len) as usize];
        reader.read_exact(&mut frame).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("frame {} is truncated", frames.len()),
                )
            } else {
                e
            }
        })?;
        frames.push(frame);
    }
    Ok(frames)
}

pub fn write_frames<W: Write, F: AsRef<[u8]>>(mut writer: W, frames: &[F]) -> io::Result<()> {
    for frame in frames {
        let frame = frame.as_ref();
        let len = u16::try_from(frame.len()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {} bytes does not fit a u16 length", frame.len()),
            )
        })?;
        writer.write_all(&len.to_be_bytes())?;
        writer.write_all(frame)?;
    }
    writer.flush()
}

pub async fn load_frames(path: impl AsRef<Path>) -> io::Result<Vec<Vec<u8>>> {
    let data = tokio::fs::read(path).await?;
    read_frames(data.as_slice())
}

pub async fn save_frames<F: AsRef<[u8]>>(path: impl AsRef<Path>, frames: &[F]) -> io::Result<()> {
    let mut data = Vec::new();
    write_frames(&mut data, frames)?;
    tokio::fs::write(path, data).await
}

impl SilencePreamble {
    pub async fn load(&self) -> io::Result<Vec<Vec<u8>>> {
        match self {
            SilencePreamble::Builtin => Ok(vec![SILENCE_FRAME.to_vec(); SILENCE_FRAME_COUNT]),
            SilencePreamble::File(path) => load_frames(path).await,
            SilencePreamble::Disabled => Ok(Vec::new()),
        }
    }
}
