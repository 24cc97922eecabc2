//! Protocol classification from buffered connection bytes
//!
//! A connection is routed to the RPC server only when it opens with the
//! HTTP/2 client preface and its first request carries a `content-type`
//! starting with `application/grpc`. Everything else, including HTTP/1.x
//! and non-gRPC HTTP/2, belongs to the HTTP server.
//!
//! Some clients send nothing past their SETTINGS until the server's SETTINGS
//! arrive. For those the caller writes [`EMPTY_SETTINGS`](crate::EMPTY_SETTINGS)
//! when [`Classifier::should_send_settings`] says so. The client's
//! acknowledgement of that frame must not reach the real server, which never
//! sent it, so the classifier holds its decision until the ACK is buffered
//! and reports where it sits via [`Classifier::settings_ack`].

use std::ops::Range;

use bytes::BytesMut;

use crate::error::WireError;
use crate::frame::{
    header_block_fragment, FrameHeader, FrameKind, FLAG_ACK, FLAG_END_HEADERS, FRAME_HEADER_SIZE,
    HTTP2_PREFACE,
};

/// Upper bound on bytes buffered before giving up and routing to HTTP
pub const MAX_SNIFF_BYTES: usize = 64 * 1024;

/// Content type prefix that marks a gRPC request
pub const GRPC_CONTENT_TYPE: &[u8] = b"application/grpc";

/// Which server a connection belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// gRPC over HTTP/2
    Rpc,
    /// Any other HTTP traffic
    Http,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rpc => write!(f, "rpc"),
            Self::Http => write!(f, "http"),
        }
    }
}

/// Progress of the SETTINGS exchange done on the server's behalf
#[derive(Debug, Clone, Default, PartialEq, Eq)]
enum ServerSettings {
    #[default]
    NotSent,
    AwaitingAck,
    /// Byte range of the client's ACK in the buffer
    Acked(Range<usize>),
}

/// Incremental classifier over a growing connection buffer
///
/// Call [`Classifier::classify`] with the full buffer read so far each time
/// more bytes arrive. Frames that were already examined are not re-parsed.
#[derive(Debug, Default)]
pub struct Classifier {
    /// Offset of the next unexamined frame
    offset: usize,
    preface_seen: bool,
    client_settings_seen: bool,
    /// Stream id and accumulated fragment of an unfinished header block
    open_block: Option<(u32, BytesMut)>,
    decided: Option<Protocol>,
    server_settings: ServerSettings,
}

impl Classifier {
    /// Create a classifier for a fresh connection
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify the connection from everything buffered so far
    ///
    /// Returns `Ok(None)` when more bytes are needed. Once server SETTINGS
    /// were sent the decision is held back until the client acknowledged them.
    pub fn classify(&mut self, buf: &[u8]) -> Result<Option<Protocol>, WireError> {
        if !self.preface_seen {
            let n = buf.len().min(HTTP2_PREFACE.len());
            if buf[..n] != HTTP2_PREFACE[..n] {
                return Ok(Some(Protocol::Http));
            }
            if n < HTTP2_PREFACE.len() {
                return Ok(None);
            }
            self.preface_seen = true;
            self.offset = HTTP2_PREFACE.len();
        }

        while let Some(header) = FrameHeader::peek(&buf[self.offset..]) {
            let start = self.offset;
            let rest = &buf[start..];
            if rest.len() < header.frame_len() {
                break;
            }
            let payload = &rest[FRAME_HEADER_SIZE..header.frame_len()];
            self.offset += header.frame_len();

            if self.is_settings_ack(&header) {
                self.server_settings = ServerSettings::Acked(start..self.offset);
            } else if self.decided.is_none() {
                self.decided = self.on_frame(&header, payload)?;
            }

            if let Some(protocol) = self.ready() {
                return Ok(Some(protocol));
            }
        }

        if buf.len() >= MAX_SNIFF_BYTES {
            tracing::debug!(
                "No request headers within {} bytes, treating connection as HTTP",
                MAX_SNIFF_BYTES
            );
            return Ok(Some(self.decided.unwrap_or(Protocol::Http)));
        }

        Ok(None)
    }

    /// Whether the client is now owed a server SETTINGS frame
    ///
    /// True once the preface and the client's SETTINGS are in and no
    /// request has started yet.
    pub fn should_send_settings(&self) -> bool {
        self.client_settings_seen
            && self.server_settings == ServerSettings::NotSent
            && self.decided.is_none()
            && self.open_block.is_none()
    }

    /// Record that an empty server SETTINGS frame was written
    pub fn settings_sent(&mut self) {
        self.server_settings = ServerSettings::AwaitingAck;
    }

    /// Buffer range holding the client's ACK of the server SETTINGS
    ///
    /// These bytes must be removed before the buffer is replayed.
    pub fn settings_ack(&self) -> Option<Range<usize>> {
        match &self.server_settings {
            ServerSettings::Acked(range) => Some(range.clone()),
            _ => None,
        }
    }

    fn ready(&self) -> Option<Protocol> {
        match self.server_settings {
            ServerSettings::AwaitingAck => None,
            _ => self.decided,
        }
    }

    fn is_settings_ack(&self, header: &FrameHeader) -> bool {
        header.kind == FrameKind::Settings
            && header.has_flag(FLAG_ACK)
            && self.server_settings == ServerSettings::AwaitingAck
            && self.open_block.is_none()
    }

    fn on_frame(
        &mut self,
        header: &FrameHeader,
        payload: &[u8],
    ) -> Result<Option<Protocol>, WireError> {
        if let Some((stream_id, block)) = self.open_block.as_mut() {
            if header.kind != FrameKind::Continuation || header.stream_id != *stream_id {
                return Err(WireError::InterleavedHeaderBlock {
                    found: header.kind,
                    stream_id: *stream_id,
                });
            }
            block.extend_from_slice(payload);
        } else {
            match header.kind {
                FrameKind::Headers => {
                    let fragment = header_block_fragment(header, payload)?;
                    self.open_block = Some((header.stream_id, BytesMut::from(fragment)));
                }
                FrameKind::Continuation => {
                    return Err(WireError::MalformedFrame("CONTINUATION without HEADERS"));
                }
                FrameKind::Settings => {
                    if !header.has_flag(FLAG_ACK) {
                        self.client_settings_seen = true;
                    }
                    return Ok(None);
                }
                // WINDOW_UPDATE, PING and friends precede the request
                _ => return Ok(None),
            }
        }

        if !header.has_flag(FLAG_END_HEADERS) {
            return Ok(None);
        }

        match self.open_block.take() {
            Some((_, block)) => protocol_for_header_block(&block).map(Some),
            None => Ok(None),
        }
    }
}

/// Decide the protocol from a complete HPACK header block
pub fn protocol_for_header_block(block: &[u8]) -> Result<Protocol, WireError> {
    let headers = hpack::Decoder::new()
        .decode(block)
        .map_err(|e| WireError::Hpack(format!("{:?}", e)))?;

    let is_rpc = headers.iter().any(|(name, value)| {
        name.eq_ignore_ascii_case(b"content-type") && value.starts_with(GRPC_CONTENT_TYPE)
    });

    Ok(if is_rpc { Protocol::Rpc } else { Protocol::Http })
}
