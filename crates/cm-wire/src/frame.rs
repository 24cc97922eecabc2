//! HTTP/2 frame header decoding
//!
//! Every frame after the client preface starts with a 9-byte header:
//! - length: 3 bytes (u24, big-endian)
//! - type: 1 byte
//! - flags: 1 byte
//! - stream identifier: 4 bytes (high bit reserved)

use bytes::{Buf, BufMut, BytesMut};

use crate::error::WireError;

/// Client connection preface that opens every HTTP/2 connection
pub const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Size of the frame header in bytes
pub const FRAME_HEADER_SIZE: usize = 9;

/// ACK flag on SETTINGS and PING frames
pub const FLAG_ACK: u8 = 0x1;

/// END_HEADERS flag on HEADERS and CONTINUATION frames
pub const FLAG_END_HEADERS: u8 = 0x4;

/// PADDED flag on HEADERS frames
pub const FLAG_PADDED: u8 = 0x8;

/// PRIORITY flag on HEADERS frames
pub const FLAG_PRIORITY: u8 = 0x20;

/// Empty server SETTINGS frame: every setting keeps its default
pub const EMPTY_SETTINGS: [u8; FRAME_HEADER_SIZE] = [0, 0, 0, 0x4, 0, 0, 0, 0, 0];

/// Frame types from RFC 9113 section 6
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    /// Extension frame types are carried through untouched
    Unknown(u8),
}

impl FrameKind {
    /// Map a type byte to a frame kind
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x0 => Self::Data,
            0x1 => Self::Headers,
            0x2 => Self::Priority,
            0x3 => Self::RstStream,
            0x4 => Self::Settings,
            0x5 => Self::PushPromise,
            0x6 => Self::Ping,
            0x7 => Self::GoAway,
            0x8 => Self::WindowUpdate,
            0x9 => Self::Continuation,
            other => Self::Unknown(other),
        }
    }

    /// Convert to the on-wire type byte
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Data => 0x0,
            Self::Headers => 0x1,
            Self::Priority => 0x2,
            Self::RstStream => 0x3,
            Self::Settings => 0x4,
            Self::PushPromise => 0x5,
            Self::Ping => 0x6,
            Self::GoAway => 0x7,
            Self::WindowUpdate => 0x8,
            Self::Continuation => 0x9,
            Self::Unknown(other) => other,
        }
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload length in bytes (24-bit)
    pub length: u32,
    /// Frame type
    pub kind: FrameKind,
    /// Type-specific flags
    pub flags: u8,
    /// Stream identifier with the reserved bit cleared
    pub stream_id: u32,
}

impl FrameHeader {
    /// Create a new frame header
    pub fn new(kind: FrameKind, flags: u8, stream_id: u32, length: u32) -> Self {
        Self {
            length,
            kind,
            flags,
            stream_id,
        }
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(FRAME_HEADER_SIZE);
        dst.put_u8((self.length >> 16) as u8);
        dst.put_u16(self.length as u16);
        dst.put_u8(self.kind.as_u8());
        dst.put_u8(self.flags);
        dst.put_u32(self.stream_id & 0x7FFF_FFFF);
    }

    /// Decode a header from the front of `src` without consuming it
    ///
    /// Returns None if fewer than [`FRAME_HEADER_SIZE`] bytes are available.
    pub fn peek(src: &[u8]) -> Option<Self> {
        if src.len() < FRAME_HEADER_SIZE {
            return None;
        }

        let mut buf = &src[..FRAME_HEADER_SIZE];
        let len_high = buf.get_u8() as u32;
        let len_low = buf.get_u16() as u32;
        let kind = FrameKind::from_u8(buf.get_u8());
        let flags = buf.get_u8();
        let stream_id = buf.get_u32() & 0x7FFF_FFFF;

        Some(Self {
            length: (len_high << 16) | len_low,
            kind,
            flags,
            stream_id,
        })
    }

    /// Whether `flag` is set on this frame
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag == flag
    }

    /// Total size of the frame including its header
    pub fn frame_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.length as usize
    }
}

/// Strip padding and priority fields from a HEADERS payload
///
/// CONTINUATION payloads carry no extra fields and are returned as-is.
pub fn header_block_fragment<'a>(
    header: &FrameHeader,
    payload: &'a [u8],
) -> Result<&'a [u8], WireError> {
    if header.kind != FrameKind::Headers {
        return Ok(payload);
    }

    let mut start = 0;
    let mut end = payload.len();

    if header.has_flag(FLAG_PADDED) {
        let pad_length = *payload
            .first()
            .ok_or(WireError::MalformedFrame("missing pad length"))? as usize;
        start += 1;
        end = end
            .checked_sub(pad_length)
            .ok_or(WireError::MalformedFrame("padding exceeds payload"))?;
    }

    if header.has_flag(FLAG_PRIORITY) {
        // stream dependency (4) + weight (1)
        start += 5;
    }

    if start > end {
        return Err(WireError::MalformedFrame("header fields exceed payload"));
    }

    Ok(&payload[start..end])
}
