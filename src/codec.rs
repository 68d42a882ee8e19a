//! Length-prefixed framing for sync messages.
//!
//! Each frame is `len: u32 LE | crc32: u32 LE | payload`, where the payload
//! is the MessagePack encoding of one message. A reader that hits end of input
//! exactly on a frame boundary reports a clean close.

use crate::error::{Result, SyncError};
use crate::stream::{RequestStream, ResponseStream, ServerStream};
use crate::types::{SyncRequest, SyncResponse};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, ErrorKind, Read, Write};

/// Largest payload accepted in either direction.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

const FRAME_HEADER_SIZE: usize = 8;

/// Encode one message as a complete frame.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let payload = rmp_serde::to_vec(message)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(SyncError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Read one frame. Returns `None` on end of input before any header byte.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    if !read_header(reader, &mut header)? {
        return Ok(None);
    }

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&header[0..4]);
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(SyncError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut checksum_bytes = [0u8; 4];
    checksum_bytes.copy_from_slice(&header[4..8]);
    let stored_checksum = u32::from_le_bytes(checksum_bytes);

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).map_err(truncated)?;

    let computed_checksum = crc32fast::hash(&payload);
    if stored_checksum != computed_checksum {
        return Err(SyncError::ChecksumMismatch {
            expected: stored_checksum,
            got: computed_checksum,
        });
    }

    Ok(Some(rmp_serde::from_slice(&payload)?))
}

/// Fill `header`, distinguishing a clean close from a torn frame.
fn read_header<R: Read>(reader: &mut R, header: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(SyncError::Transport(
                    "stream closed inside a frame header".into(),
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(SyncError::Transport(e.to_string())),
        }
    }
    Ok(true)
}

fn truncated(e: io::Error) -> SyncError {
    if e.kind() == ErrorKind::UnexpectedEof {
        SyncError::Transport("stream closed inside a frame".into())
    } else {
        SyncError::Transport(e.to_string())
    }
}

/// Reads framed messages from a byte stream.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> RequestStream for FrameReader<R> {
    fn recv(&mut self) -> Result<Option<SyncRequest>> {
        read_frame(&mut self.inner)
    }
}

impl<R: Read> ResponseStream for FrameReader<R> {
    fn recv(&mut self) -> Result<Option<SyncResponse>> {
        read_frame(&mut self.inner)
    }
}

/// Writes framed messages to a byte stream, one whole frame per call.
pub struct FrameWriter<W> {
    inner: Mutex<W>,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Write any serializable message as a frame and flush it.
    pub fn write_message<T: Serialize>(&self, message: &T) -> Result<()> {
        let frame = encode_frame(message)?;
        let mut inner = self.inner.lock();
        inner
            .write_all(&frame)
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        inner
            .flush()
            .map_err(|e| SyncError::Transport(e.to_string()))
    }

    pub fn into_inner(self) -> W {
        self.inner.into_inner()
    }
}

impl<W: Write + Send> ServerStream for FrameWriter<W> {
    fn send(&self, response: &SyncResponse) -> Result<()> {
        self.write_message(response)
    }
}
