//! Trellis frame format — the unit of multiplexing on a link.
//!
//! A frame is `type:u8 | channel_id:u16 | length:u16 | payload`, all
//! integers big-endian. The codec never interprets payload bytes; the
//! relay layer above owns their meaning. Changing anything here is a
//! breaking wire change.

use std::io;

use bytes::{Bytes, BytesMut};
use static_assertions::assert_eq_size;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zerocopy::byteorder::{BigEndian, U16};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::keys::{PublicKey, KEY_LEN};

/// Maximum payload carried by a single frame.
pub const MAX_PAYLOAD: usize = 65535;

/// Wire size of the fixed frame header.
pub const HEADER_LEN: usize = 5;

/// Request payload: `initiator_pk(32) ‖ responder_pk(32)`.
pub const REQUEST_PAYLOAD_LEN: usize = 2 * KEY_LEN;

// ── Frame types ───────────────────────────────────────────────────────────────

/// The closed set of frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Open a channel. Payload is the 64-byte key pair.
    Request = 1,
    /// Confirm a channel open. Empty payload.
    Accept = 2,
    /// Close a channel. Payload is a one-byte reason code.
    Close = 3,
    /// Opaque channel bytes, 1..=65535 in length.
    Data = 4,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Request),
            2 => Ok(Self::Accept),
            3 => Ok(Self::Close),
            4 => Ok(Self::Data),
            other => Err(FrameError::BadFrameType(other)),
        }
    }
}

// ── Close reasons ─────────────────────────────────────────────────────────────

/// Reason code carried in a `Close` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CloseReason {
    Normal = 0,
    Rejected = 1,
    Protocol = 2,
    FlowExceeded = 3,
}

impl CloseReason {
    /// Decode a `Close` payload. Unknown or missing codes are logged and
    /// treated as `Normal`.
    pub fn from_payload(payload: &[u8]) -> Self {
        match payload.first() {
            Some(0) => Self::Normal,
            Some(1) => Self::Rejected,
            Some(2) => Self::Protocol,
            Some(3) => Self::FlowExceeded,
            Some(other) => {
                tracing::warn!(code = other, "unknown close reason, treating as normal");
                Self::Normal
            }
            None => {
                tracing::warn!("empty close payload, treating as normal");
                Self::Normal
            }
        }
    }
}

// ── Header ────────────────────────────────────────────────────────────────────

/// The 5-byte frame header as it appears on the wire.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
struct FrameHeader {
    frame_type: u8,
    channel_id: U16<BigEndian>,
    length: U16<BigEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(FrameHeader, [u8; HEADER_LEN]);

// ── Frame ─────────────────────────────────────────────────────────────────────

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub channel_id: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn request(channel_id: u16, initiator: &PublicKey, responder: &PublicKey) -> Self {
        let mut payload = BytesMut::with_capacity(REQUEST_PAYLOAD_LEN);
        payload.extend_from_slice(initiator.as_bytes());
        payload.extend_from_slice(responder.as_bytes());
        Self {
            frame_type: FrameType::Request,
            channel_id,
            payload: payload.freeze(),
        }
    }

    pub fn accept(channel_id: u16) -> Self {
        Self {
            frame_type: FrameType::Accept,
            channel_id,
            payload: Bytes::new(),
        }
    }

    pub fn close(channel_id: u16, reason: CloseReason) -> Self {
        Self {
            frame_type: FrameType::Close,
            channel_id,
            payload: Bytes::copy_from_slice(&[reason as u8]),
        }
    }

    pub fn data(channel_id: u16, payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::Data,
            channel_id,
            payload,
        }
    }

    /// Split a `Request` payload into `(initiator_pk, responder_pk)`.
    /// Returns `None` unless the payload is exactly 64 bytes.
    pub fn split_request(payload: &[u8]) -> Option<(PublicKey, PublicKey)> {
        if payload.len() != REQUEST_PAYLOAD_LEN {
            return None;
        }
        let initiator = PublicKey::from_slice(&payload[..KEY_LEN]).ok()?;
        let responder = PublicKey::from_slice(&payload[KEY_LEN..]).ok()?;
        Some((initiator, responder))
    }
}

// ── Codec ─────────────────────────────────────────────────────────────────────

/// Read the next frame off `r`.
///
/// Returns `Ok(None)` when the stream ends cleanly between frames. An end
/// of stream in the middle of a frame is a `ShortRead`. Framing errors are
/// fatal to the link; the caller must not continue reading after one.
pub async fn read_frame<R>(r: &mut R) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_LEN];

    // First byte read separately so a clean close between frames is
    // distinguishable from a truncated frame.
    match r.read(&mut header_buf[..1]).await {
        Ok(0) => return Ok(None),
        Ok(_) => {}
        Err(e) => return Err(FrameError::Io(e)),
    }
    r.read_exact(&mut header_buf[1..])
        .await
        .map_err(into_short_read)?;

    let header = FrameHeader::read_from(&header_buf[..]).ok_or(FrameError::ShortRead)?;
    let frame_type = FrameType::try_from(header.frame_type)?;
    let length = header.length.get() as usize;

    if frame_type == FrameType::Data && length == 0 {
        return Err(FrameError::EmptyData);
    }

    let mut payload = vec![0u8; length];
    r.read_exact(&mut payload).await.map_err(into_short_read)?;

    Ok(Some(Frame {
        frame_type,
        channel_id: header.channel_id.get(),
        payload: payload.into(),
    }))
}

/// Write one frame to `w` and flush it.
///
/// The caller serializes access to `w`; frames from concurrent writers must
/// never interleave.
pub async fn write_frame<W>(w: &mut W, frame: &Frame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let len = frame.payload.len();
    if len > MAX_PAYLOAD {
        return Err(FrameError::OversizedPayload(len));
    }

    let header = FrameHeader {
        frame_type: frame.frame_type as u8,
        channel_id: U16::new(frame.channel_id),
        length: U16::new(len as u16),
    };

    // One buffer, one write: header and payload go out back to back.
    let mut buf = BytesMut::with_capacity(HEADER_LEN + len);
    buf.extend_from_slice(header.as_bytes());
    buf.extend_from_slice(&frame.payload);

    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

fn into_short_read(e: io::Error) -> FrameError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        FrameError::ShortRead
    } else {
        FrameError::Io(e)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),

    #[error("stream ended mid-frame")]
    ShortRead,

    #[error("unknown frame type 0x{0:02x}")]
    BadFrameType(u8),

    #[error("zero-length data frame")]
    EmptyData,

    #[error("payload length {0} exceeds {MAX_PAYLOAD}")]
    OversizedPayload(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
