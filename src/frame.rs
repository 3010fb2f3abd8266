//! Length-prefixed frame codec for the client/daemon wire protocol.
//!
//! A frame is a 5-byte header followed by an opaque payload:
//!
//! ```text
//! +---------------------------+-----------+------------------+
//! | Length (4 bytes, BE)      | Tag (u8)  | Payload          |
//! +---------------------------+-----------+------------------+
//! ```
//!
//! The length counts payload bytes only. Tags are ABI-stable; an unknown
//! tag or an oversized length is a fatal protocol error, not a recoverable
//! one. The decoder accepts arbitrary chunking and buffers at most one
//! partial frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on a frame payload (16 MiB).
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 5;

/// Wire frame type tags.
///
/// The numeric values are part of the protocol and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Client asks to reuse a pooled session.
    Reuse = 1,
    /// Client asks to establish a session.
    Connect = 2,
    /// Daemon forwards a keyboard-interactive challenge.
    Challenge = 3,
    /// Client answers a challenge.
    ChallengeResponse = 4,
    /// Connection established.
    Connected = 5,
    /// Connection attempt failed (recoverable).
    Unconnected = 6,
    /// Established session dropped.
    Disconnected = 7,
    /// Execute a command without a PTY.
    SimpleCommand = 8,
    /// Execute a command with a PTY.
    PtyCommand = 9,
    /// Command completion.
    Result = 10,
    /// Command input bytes; zero-length payload signals EOF.
    Stdin = 11,
    /// Command output bytes.
    Stdout = 12,
    /// Command error-stream bytes.
    Stderr = 13,
    /// Fatal protocol violation report.
    Exception = 14,
    /// Client asks to park the session under a share key.
    Share = 15,
    /// Daemon returns the share key.
    Shared = 16,
    /// Window size update.
    Resize = 17,
}

impl FrameType {
    /// Decode a wire tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => FrameType::Reuse,
            2 => FrameType::Connect,
            3 => FrameType::Challenge,
            4 => FrameType::ChallengeResponse,
            5 => FrameType::Connected,
            6 => FrameType::Unconnected,
            7 => FrameType::Disconnected,
            8 => FrameType::SimpleCommand,
            9 => FrameType::PtyCommand,
            10 => FrameType::Result,
            11 => FrameType::Stdin,
            12 => FrameType::Stdout,
            13 => FrameType::Stderr,
            14 => FrameType::Exception,
            15 => FrameType::Share,
            16 => FrameType::Shared,
            17 => FrameType::Resize,
            _ => return None,
        })
    }

    pub fn tag(&self) -> u8 {
        *self as u8
    }
}

/// A decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame around raw payload bytes.
    pub fn new(frame_type: FrameType, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type,
            payload: payload.into(),
        }
    }

    /// Build a frame with an empty payload.
    pub fn empty(frame_type: FrameType) -> Self {
        Self::new(frame_type, Bytes::new())
    }

    /// Build a frame carrying a JSON payload.
    pub fn json<T: Serialize>(frame_type: FrameType, payload: &T) -> Result<Self, FrameError> {
        let bytes = serde_json::to_vec(payload)
            .map_err(|e| FrameError::Payload(format!("failed to encode payload: {}", e)))?;
        Ok(Self::new(frame_type, bytes))
    }
}

/// Fatal framing error.
#[derive(Debug)]
pub enum FrameError {
    /// The header announced a payload larger than [`MAX_PAYLOAD_LEN`].
    Oversize(usize),
    /// The header carried a tag outside the protocol table.
    UnknownTag(u8),
    /// Payload serialization failed.
    Payload(String),
    /// Underlying transport error.
    Io(std::io::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Oversize(len) => write!(
                f,
                "frame payload of {} bytes exceeds the {} byte limit",
                len, MAX_PAYLOAD_LEN
            ),
            FrameError::UnknownTag(tag) => write!(f, "unknown frame tag {}", tag),
            FrameError::Payload(msg) => f.write_str(msg),
            FrameError::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        FrameError::Io(e)
    }
}

/// Codec turning a byte stream into [`Frame`]s and back.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; 4];
        header.copy_from_slice(&src[..4]);
        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_PAYLOAD_LEN {
            return Err(FrameError::Oversize(len));
        }

        let tag = src[4];
        let frame_type = FrameType::from_tag(tag).ok_or(FrameError::UnknownTag(tag))?;

        if src.len() < HEADER_LEN + len {
            // Hold at most this one partial frame.
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame {
            frame_type,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let len = frame.payload.len();
        if len > MAX_PAYLOAD_LEN {
            return Err(FrameError::Oversize(len));
        }

        dst.reserve(HEADER_LEN + len);
        dst.put_u32(len as u32);
        dst.put_u8(frame.frame_type.tag());
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
